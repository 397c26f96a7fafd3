// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod basic_tests;
mod test_helpers;
