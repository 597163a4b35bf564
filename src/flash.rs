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

//! Firmware programming.
//!
//! A raw binary image is written to flash in 256-byte chunks starting at
//! the flash base. The whole flash is mass-erased first; a failed chunk
//! fails the operation and leaves the flash in an undefined state, so
//! recovery is a retry of the full write.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use serial::SerialPort;

use crate::constants::{FLASH_BASE, MAX_RW_SIZE};
use crate::{Bootloader, Error, Result};

/// Erase the flash and program the image at `path` into it.
///
/// After each chunk `progress` is called with the number of chunks still
/// counted against the operation, the chunk just written included; for an
/// image of `N` chunks the ticks run `N, N-1, …, 1`.
///
/// The `stop` flag is sampled between transactions only; a transaction in
/// flight always runs to completion or times out on its own.
pub fn write_firmware<P, F>(
    bl: &mut Bootloader<P>,
    path: &Path,
    stop: &AtomicBool,
    mut progress: F,
) -> Result<()>
where
    P: SerialPort,
    F: FnMut(usize),
{
    let mut file = File::open(path).map_err(Error::File)?;
    let mut image = Vec::new();
    file.read_to_end(&mut image).map_err(Error::File)?;

    let total = (image.len() + MAX_RW_SIZE - 1) / MAX_RW_SIZE;
    info!(
        "programming {} ({} bytes, {} chunks)",
        path.display(),
        image.len(),
        total
    );

    bl.mass_erase()?;

    for (index, chunk) in image.chunks(MAX_RW_SIZE).enumerate() {
        if stop.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        // Short tails are padded up to a full chunk with erased-flash bytes.
        let mut buf = [0xFFu8; MAX_RW_SIZE];
        buf[..chunk.len()].copy_from_slice(chunk);

        let address = FLASH_BASE + (index * MAX_RW_SIZE) as u32;
        debug!("chunk {}/{} at 0x{:08X}", index + 1, total, address);
        bl.write_memory(address, &buf)?;

        progress(total - index);
    }

    info!("programming complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ACK;
    use crate::testutil::MockPort;
    use std::path::PathBuf;

    fn temp_image(name: &str, data: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("stm32-isp-{}-{}", std::process::id(), name));
        std::fs::write(&path, data).unwrap();
        path
    }

    fn acks(n: usize) -> Vec<u8> {
        vec![ACK; n]
    }

    #[test]
    fn hundred_byte_image_is_one_padded_chunk() {
        let image: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let path = temp_image("one-chunk.bin", &image);

        // Two ACKs for the erase, three for the single write.
        let mut bl = Bootloader::new(MockPort::with_rx(&acks(5)));
        let mut ticks = Vec::new();
        let stop = AtomicBool::new(false);
        write_firmware(&mut bl, &path, &stop, |n| ticks.push(n)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(ticks, vec![1]);

        let tx = &bl.port.tx;
        // Erase: command frame plus the mass-erase special frame.
        assert_eq!(&tx[..5], &[0x44, 0xBB, 0xFF, 0xFF, 0x00]);
        // Write: command frame, address frame for the flash base.
        assert_eq!(&tx[5..7], &[0x31, 0xCE]);
        assert_eq!(&tx[7..12], &[0x08, 0x00, 0x00, 0x00, 0x08]);
        // Data frame: N-1, 100 image bytes, 156 pad bytes, checksum.
        assert_eq!(tx[12], 0xFF);
        assert_eq!(&tx[13..113], &image[..]);
        assert!(tx[113..269].iter().all(|b| *b == 0xFF));
        let expected = tx[13..269].iter().fold(0xFFu8, |acc, b| acc ^ *b);
        assert_eq!(tx[269], expected);
        assert_eq!(tx.len(), 270);
    }

    #[test]
    fn chunk_addresses_form_arithmetic_sequence() {
        let image = vec![0xA5u8; 600];
        let path = temp_image("three-chunks.bin", &image);

        // ceil(600 / 256) = 3 chunks.
        let mut bl = Bootloader::new(MockPort::with_rx(&acks(2 + 3 * 3)));
        let mut ticks = Vec::new();
        let stop = AtomicBool::new(false);
        write_firmware(&mut bl, &path, &stop, |n| ticks.push(n)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(ticks, vec![3, 2, 1]);

        // Each write transaction is 2 (command) + 5 (address) + 258 (data)
        // bytes; the erase preamble is 5.
        let tx = &bl.port.tx;
        for (index, expected) in [0x0800_0000u32, 0x0800_0100, 0x0800_0200]
            .iter()
            .enumerate()
        {
            let base = 5 + index * (2 + 5 + 258);
            let frame = &tx[base + 2..base + 7];
            assert_eq!(
                u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]),
                *expected
            );
        }

        // 600 = 2 * 256 + 88: the tail chunk carries 88 image bytes and
        // 168 pad bytes.
        let tail = 5 + 2 * (2 + 5 + 258) + 7;
        assert_eq!(tx[tail], 0xFF);
        assert!(tx[tail + 1..tail + 89].iter().all(|b| *b == 0xA5));
        assert!(tx[tail + 89..tail + 257].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn missing_file_is_a_file_error_and_touches_nothing() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[]));
        let stop = AtomicBool::new(false);
        let missing = Path::new("/nonexistent/firmware.bin");
        assert!(matches!(
            write_firmware(&mut bl, missing, &stop, |_| ()),
            Err(Error::File(_))
        ));
        assert!(bl.port.tx.is_empty());
    }

    #[test]
    fn stop_flag_cancels_at_the_first_chunk_boundary() {
        let image = vec![0u8; 512];
        let path = temp_image("cancelled.bin", &image);

        let mut bl = Bootloader::new(MockPort::with_rx(&acks(2)));
        let stop = AtomicBool::new(true);
        let result = write_firmware(&mut bl, &path, &stop, |_| ());
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        // The erase went out, no write did.
        assert_eq!(bl.port.tx.len(), 5);
    }

    #[test]
    fn failed_chunk_aborts_the_operation() {
        let image = vec![0u8; 512];
        let path = temp_image("failed-chunk.bin", &image);

        // Erase succeeds, first write command is NACKed.
        let mut rx = acks(2);
        rx.push(crate::constants::NACK);
        let mut bl = Bootloader::new(MockPort::with_rx(&rx));
        let mut ticks = Vec::new();
        let stop = AtomicBool::new(false);
        let result = write_firmware(&mut bl, &path, &stop, |n| ticks.push(n));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(Error::Nack)));
        assert!(ticks.is_empty());
    }
}
