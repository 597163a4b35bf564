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

/// Wake-up byte written once to start the bootloader session.
pub const INIT: u8                      = 0x7F;

/// ACK byte
pub const ACK: u8                       = 0x79;
/// NACK byte
pub const NACK: u8                      = 0x1F;

pub const CMD_GET: u8                   = 0x00;
pub const CMD_GET_VERSION: u8           = 0x01;
pub const CMD_GET_ID: u8                = 0x02;
pub const CMD_READ_MEMORY: u8           = 0x11;
pub const CMD_GO: u8                    = 0x21;
pub const CMD_WRITE_MEMORY: u8          = 0x31;
pub const CMD_ERASE_MEMORY: u8          = 0x43;
pub const CMD_ERASE_MEMORY_EXT: u8      = 0x44;
pub const CMD_WRITE_PROTECT: u8         = 0x63;
pub const CMD_WRITE_UNPROTECT: u8       = 0x73;
pub const CMD_READOUT_PROTECT: u8       = 0x82;
pub const CMD_READOUT_UNPROTECT: u8     = 0x92;

/// Special code sent with [`CMD_ERASE_MEMORY_EXT`] to erase the whole flash.
pub const MASS_ERASE_CODE: u16          = 0xFFFF;

/// Base address of the target's internal flash.
pub const FLASH_BASE: u32               = 0x0800_0000;

/// Maximum payload per READ_MEMORY / WRITE_MEMORY transaction.
pub const MAX_RW_SIZE: usize            = 256;

/// Flash address of the application's version word.
pub const USER_DATA_OFFSET: u32         = 0x0800_0188;

/// Version compiled into the matching application image.
pub const APP_VERSION: u32              = 0x0000_1200;

/// Serial device wired to the target's bootloader UART.
pub const TTY_DEV: &str                 = "/dev/ttymxc4";

/// I2C bus holding the port expander that drives BOOT0 and NRST.
pub const I2C_DEV: &str                 = "/dev/i2c-0";
/// Port expander slave address.
pub const I2C_ADDR: u16                 = 0x3E;

/// Firmware image used when no path is given on the command line.
pub const DEFAULT_FIRMWARE: &str        = "/home/root/main.bin";

/// Rendezvous path for the daemon's control socket.
pub const SOCKET_PATH: &str             = "/tmp/tioSocket";
