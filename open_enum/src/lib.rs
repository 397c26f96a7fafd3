// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro.

/// Declares an enum-like type that tolerates values outside the named
/// set, avoiding the undefined behavior of matching a C-style enum
/// against an out-of-range value. The generated item is a
/// `#[repr(transparent)]` newtype over the storage type with one `pub`
/// const per variant, so it can sit directly in wire-format structs and
/// round-trip through raw bytes.
///
/// `Copy`, `Clone`, `Eq`, `PartialEq`, `Hash`, `Ord`, and `PartialOrd`
/// are derived; `Debug` prints the variant name when the value matches
/// one, and the raw value otherwise. Attributes written above the enum
/// (including extra derives) are applied to the generated struct.
///
/// # Example
///
/// ```
/// use open_enum::open_enum;
///
/// open_enum! {
///     pub enum Status: u8 {
///         GOOD = 0x00,
///         CHECK_CONDITION = 0x02,
///     }
/// }
///
/// assert_eq!(Status::GOOD.0, 0);
/// assert_eq!(format!("{:?}", Status(0x42)), "66");
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$attr:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$attr])*
        $v struct $name(pub $storage);

        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #![allow(unreachable_patterns)]
                let s = match *self {
                    $( Self::$variant => stringify!($variant), )*
                    _ => return ::core::fmt::Debug::fmt(&self.0, fmt),
                };
                fmt.pad(s)
            }
        }
    }
}
