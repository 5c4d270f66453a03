//  Copyright 2025 Cellar Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

/// Assertion that only takes effect with debug assertions or the
/// `strict_assertions` feature enabled.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        if cfg!(feature = "strict_assertions") {
            assert!($($arg)*);
        } else {
            debug_assert!($($arg)*);
        }
    };
}

/// Equality assertion that only takes effect with debug assertions or the
/// `strict_assertions` feature enabled.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {
        if cfg!(feature = "strict_assertions") {
            assert_eq!($($arg)*);
        } else {
            debug_assert_eq!($($arg)*);
        }
    };
}

/// Inequality assertion that only takes effect with debug assertions or the
/// `strict_assertions` feature enabled.
#[macro_export]
macro_rules! strict_assert_ne {
    ($($arg:tt)*) => {
        if cfg!(feature = "strict_assertions") {
            assert_ne!($($arg)*);
        } else {
            debug_assert_ne!($($arg)*);
        }
    };
}
