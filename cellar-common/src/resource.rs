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

use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

/// Byte counts per storage tier.
///
/// Every budget, reservation and charge in the cache is a pair of byte
/// counts, one per tier, adjusted together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory: usize,
    pub disk: usize,
}

impl ResourceUsage {
    pub const fn new(memory: usize, disk: usize) -> Self {
        Self { memory, disk }
    }

    pub const fn memory(bytes: usize) -> Self {
        Self { memory: bytes, disk: 0 }
    }

    pub const fn disk(bytes: usize) -> Self {
        Self { memory: 0, disk: bytes }
    }

    pub fn is_zero(&self) -> bool {
        self.memory == 0 && self.disk == 0
    }

    /// Component-wise `self <= limit`.
    pub fn within(&self, limit: &Self) -> bool {
        self.memory <= limit.memory && self.disk <= limit.disk
    }

    /// Component-wise `self > limit` in at least one tier.
    pub fn exceeds(&self, limit: &Self) -> bool {
        !self.within(limit)
    }
}

impl Add for ResourceUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            memory: self.memory + rhs.memory,
            disk: self.disk + rhs.disk,
        }
    }
}

impl AddAssign for ResourceUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.memory += rhs.memory;
        self.disk += rhs.disk;
    }
}

impl Sub for ResourceUsage {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            memory: self.memory - rhs.memory,
            disk: self.disk - rhs.disk,
        }
    }
}

impl SubAssign for ResourceUsage {
    fn sub_assign(&mut self, rhs: Self) {
        self.memory -= rhs.memory;
        self.disk -= rhs.disk;
    }
}

impl Sum for ResourceUsage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, item| acc + item)
    }
}

impl Display for ResourceUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "memory: {}, disk: {}",
            ByteSize::b(self.memory as u64),
            ByteSize::b(self.disk as u64)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = ResourceUsage::new(100, 10);
        let b = ResourceUsage::new(50, 10);
        assert_eq!(a + b, ResourceUsage::new(150, 20));
        assert_eq!(a - b, ResourceUsage::new(50, 0));

        let mut c = a;
        c += b;
        c -= a;
        assert_eq!(c, b);
    }

    #[test]
    fn test_within() {
        let limit = ResourceUsage::new(100, 100);
        assert!(ResourceUsage::new(100, 100).within(&limit));
        assert!(ResourceUsage::default().within(&limit));
        assert!(ResourceUsage::new(101, 0).exceeds(&limit));
        assert!(ResourceUsage::new(0, 101).exceeds(&limit));
    }

    #[test]
    fn test_sum() {
        let total: ResourceUsage = [
            ResourceUsage::memory(50),
            ResourceUsage::memory(150),
            ResourceUsage::disk(75),
        ]
        .into_iter()
        .sum();
        assert_eq!(total, ResourceUsage::new(200, 75));
    }
}
