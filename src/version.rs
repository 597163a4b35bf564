// Copyright 2022 Reach Technology <support@reachtech.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application version word.
//!
//! The application stores a 32-bit version constant in a linker-reserved
//! flash slot at [`constants::USER_DATA_OFFSET`]. The target writes it as a
//! native (little-endian) word; the wire carries raw bytes and the protocol
//! engine does not interpret them, so decoding happens here.

use std::fmt;

use crate::constants;

/// Result of comparing a target version word against the compiled-in one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Match,
    Mismatch,
    Unchecked,
}

/// Application version word.
///
/// Four 4-bit fields: `MAJOR=[15:12]`, `MINOR=[11:8]`, `PATCH=[7:4]`,
/// `REVISION=[3:0]`.
///
/// # Example
/// ```
/// # use stm32_isp::version::AppVersion;
/// let ver = AppVersion::new(0x0000_1200);
///
/// assert_eq!(1, ver.major());
/// assert_eq!(2, ver.minor());
/// assert_eq!(0, ver.patch());
/// assert_eq!("1.2.0", ver.to_string());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersion(u32);

impl AppVersion {
    pub const fn new(word: u32) -> Self {
        AppVersion(word)
    }

    /// Decode the word as the target stores it.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        AppVersion(u32::from_le_bytes(bytes))
    }

    /// The version compiled into this build.
    pub const fn compiled_in() -> Self {
        AppVersion(constants::APP_VERSION)
    }

    pub fn word(&self) -> u32 {
        self.0
    }

    pub fn major(&self) -> u8 {
        ((self.0 >> 12) & 0xF) as u8
    }

    pub fn minor(&self) -> u8 {
        ((self.0 >> 8) & 0xF) as u8
    }

    pub fn patch(&self) -> u8 {
        ((self.0 >> 4) & 0xF) as u8
    }

    pub fn revision(&self) -> u8 {
        (self.0 & 0xF) as u8
    }

    /// Compare the full word against the compiled-in version.
    pub fn check(&self) -> VersionCheck {
        if self.0 == constants::APP_VERSION {
            VersionCheck::Match
        } else {
            VersionCheck::Mismatch
        }
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}
