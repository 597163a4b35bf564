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

//! # STM32 in-system programmer library
//!
//! Host-side interface to the STM32 ROM serial bootloader (the USART
//! protocol described in ST application note AN3155). The host talks to the
//! target over a UART and drives the target's BOOT0 and NRST pins through an
//! I2C port expander, so the target can be rebooted into and out of
//! bootloader mode without anyone touching the board.
//!
//! The crate is split the way the hardware is:
//!
//! - [`Bootloader`] is the wire-protocol engine. It is synchronous, keeps at
//!   most one command in flight and never retries.
//! - [`target::Target`] sequences the pins, the serial link and the engine
//!   to run whole sessions.
//! - [`flash`] programs a raw binary image in 256-byte chunks.
//!
//! # See also
//!
//! - [AN3155: USART protocol used in the STM32 bootloader](https://www.st.com/resource/en/application_note/cd00264342.pdf)

use std::io;

use log::{debug, trace, warn};
use serial::SerialPort;
use thiserror::Error as ThisError;

#[rustfmt::skip]
pub mod constants;
pub mod flash;
pub mod pins;
pub mod serial_port;
pub mod target;
pub mod version;

/// Errors produced while talking to the target bootloader.
#[derive(ThisError, Debug)]
pub enum Error {
    /// OS-level failure on the serial line or a control descriptor.
    #[error("I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Failure opening or configuring the serial port.
    #[error("serial port error: {0}")]
    Port(#[from] serial::Error),

    /// Expected bytes did not arrive before the line timeout.
    #[error("short read from target")]
    ShortRead,

    /// The target did not answer during an ACK phase.
    #[error("no ACK from target")]
    NoAck,

    /// The target explicitly rejected the command.
    #[error("target replied NACK")]
    Nack,

    /// The target returned a byte that is neither ACK nor NACK.
    #[error("unexpected response from target: 0x{0:02X}")]
    UnknownResponse(u8),

    /// Transfer length outside what a single bootloader transaction allows.
    #[error("unsupported transfer length: {0}")]
    TransferLength(usize),

    /// The firmware image could not be read.
    #[error("firmware file error: {0}")]
    File(#[source] io::Error),

    /// A stop request arrived between two transactions.
    #[error("operation cancelled")]
    Cancelled,

    /// The serial channel has not been opened yet.
    #[error("serial port is not open")]
    NotOpen,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Build the two-byte command frame: the opcode and its complement.
pub(crate) fn command_frame(op: u8) -> [u8; 2] {
    [op, op ^ 0xFF]
}

/// Build the five-byte address frame: big-endian address plus XOR checksum.
pub(crate) fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], a[0] ^ a[1] ^ a[2] ^ a[3]]
}

/// Protocol engine for the STM32 USART bootloader.
///
/// Every public method is one complete request/response transaction. The
/// engine holds no state between calls; on any failure it returns without
/// resynchronizing and leaves the stream wherever the target left it.
/// Recovery is the caller's job (a full pin reset plus [`Bootloader::init`]).
pub struct Bootloader<P> {
    port: P,
}

impl<P> Bootloader<P>
where
    P: SerialPort,
{
    /// Wrap an already configured serial port.
    ///
    /// No bytes are exchanged until [`Bootloader::init`] is called.
    pub fn new(port: P) -> Self {
        Bootloader { port }
    }

    /// Run the init handshake.
    ///
    /// Writes the wake-up byte and classifies the single reply byte. The
    /// target must be in bootloader mode (BOOT0 high at reset). A second
    /// init without an intervening reset may NACK; that is reported as a
    /// plain failure.
    pub fn init(&mut self) -> Result<()> {
        debug!("sending init byte 0x{:02X}", constants::INIT);
        self.port.write_all(&[constants::INIT])?;
        self.port.flush()?;
        self.read_ack()
    }

    /// Read the 16-bit product ID.
    pub fn get_id(&mut self) -> Result<u16> {
        self.write_command(constants::CMD_GET_ID)?;

        let mut buf = [0u8; 3];
        self.read_exact(&mut buf)?;
        // N + 1 bytes of ID follow; anything but a two-byte PID is bogus.
        if buf[0] != 1 {
            return Err(Error::UnknownResponse(buf[0]));
        }
        self.read_ack()?;

        let pid = u16::from_be_bytes([buf[1], buf[2]]);
        debug!("product ID 0x{:04X}", pid);
        Ok(pid)
    }

    /// Read `data.len()` bytes of target memory starting at `address`.
    ///
    /// The length must be in `1..=256`; the bootloader cannot deliver more
    /// in one transaction and a zero-length read is not representable on
    /// the wire.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        if data.is_empty() || data.len() > constants::MAX_RW_SIZE {
            return Err(Error::TransferLength(data.len()));
        }

        self.write_command(constants::CMD_READ_MEMORY)?;
        self.write_address(address)?;

        let n = (data.len() - 1) as u8;
        self.port.write_all(&[n, n ^ 0xFF])?;
        self.port.flush()?;
        self.read_ack()?;

        debug!("reading {} bytes at 0x{:08X}", data.len(), address);
        self.read_exact(data)
    }

    /// Write `data` to target memory starting at `address`.
    ///
    /// The length must be a non-zero multiple of 4 no larger than 256;
    /// flash programming is word-aligned and the bootloader NACKs anything
    /// else. Callers pad short tails before calling.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > constants::MAX_RW_SIZE || data.len() % 4 != 0 {
            return Err(Error::TransferLength(data.len()));
        }

        self.write_command(constants::CMD_WRITE_MEMORY)?;
        self.write_address(address)?;

        // One buffer, one write: length byte, payload, XOR of both.
        let n = (data.len() - 1) as u8;
        let mut buf = Vec::with_capacity(data.len() + 2);
        buf.push(n);
        buf.extend_from_slice(data);
        buf.push(data.iter().fold(n, |acc, b| acc ^ *b));

        debug!("writing {} bytes at 0x{:08X}", data.len(), address);
        self.port.write_all(&buf)?;
        self.port.flush()?;
        self.read_ack()
    }

    /// Erase the entire flash with the extended-erase mass code.
    ///
    /// Only the extended form (`0x44`) is supported; it is the one required
    /// on devices with more than 255 sectors. Selective erase is not
    /// implemented.
    pub fn mass_erase(&mut self) -> Result<()> {
        self.write_command(constants::CMD_ERASE_MEMORY_EXT)?;

        let code = constants::MASS_ERASE_CODE.to_be_bytes();
        debug!("mass erase 0x{:02X}{:02X}", code[0], code[1]);
        self.port.write_all(&[code[0], code[1], code[0] ^ code[1]])?;
        self.port.flush()?;
        self.read_ack()
    }

    /// Jump to user code at `address`.
    ///
    /// No ACK is read after the address frame: a healthy target starts
    /// executing immediately and may never answer. Callers should follow
    /// with a quiescent delay before touching the line again.
    pub fn go(&mut self, address: u32) -> Result<()> {
        self.write_command(constants::CMD_GO)?;

        debug!("go 0x{:08X}", address);
        self.port.write_all(&address_frame(address))?;
        self.port.flush()?;
        Ok(())
    }

    /// One plain read, returning whatever arrived. A line timeout counts
    /// as zero bytes. Used by the daemon to forward target chatter.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Send a command frame and consume its ACK.
    fn write_command(&mut self, op: u8) -> Result<()> {
        let frame = command_frame(op);
        trace!("command frame {:02X?}", frame);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        self.read_ack()
    }

    /// Send an address frame and consume its ACK.
    fn write_address(&mut self, address: u32) -> Result<()> {
        let frame = address_frame(address);
        trace!("address frame {:02X?}", frame);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        self.read_ack()
    }

    /// Read exactly one byte and classify it.
    ///
    /// Consumes nothing past the ACK byte; a timeout here means the target
    /// never answered the phase.
    fn read_ack(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match self.read_exact(&mut byte) {
            Ok(()) => (),
            Err(Error::ShortRead) => return Err(Error::NoAck),
            Err(e) => return Err(e),
        }

        match byte[0] {
            constants::ACK => {
                trace!("ACK");
                Ok(())
            }
            constants::NACK => {
                warn!("target replied NACK");
                Err(Error::Nack)
            }
            other => {
                warn!("unexpected reply 0x{:02X}", other);
                Err(Error::UnknownResponse(other))
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.port.read_exact(buf) {
            Ok(()) => {
                trace!("read {} bytes: {:02X?}", buf.len(), buf);
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                Err(Error::ShortRead)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(unix)]
impl<P> std::os::unix::io::AsRawFd for Bootloader<P>
where
    P: std::os::unix::io::AsRawFd,
{
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.port.as_raw_fd()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    /// Scripted serial port: `rx` holds the bytes the fake target will
    /// answer with, `tx` records everything the engine wrote.
    pub struct MockPort {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
    }

    impl MockPort {
        pub fn with_rx(rx: &[u8]) -> Self {
            MockPort {
                rx: rx.iter().copied().collect(),
                tx: Vec::new(),
            }
        }
    }

    impl io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "rx exhausted"));
            }
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[allow(bare_trait_objects)]
    impl serial::SerialPort for MockPort {
        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }
        fn set_timeout(&mut self, _timeout: Duration) -> serial::Result<()> {
            Ok(())
        }
        fn configure(&mut self, _settings: &serial::PortSettings) -> serial::Result<()> {
            Ok(())
        }
        fn reconfigure(
            &mut self,
            _setup: &Fn(&mut serial::SerialPortSettings) -> serial::Result<()>,
        ) -> serial::Result<()> {
            Ok(())
        }
        fn set_rts(&mut self, _level: bool) -> serial::Result<()> {
            unreachable!()
        }
        fn set_dtr(&mut self, _level: bool) -> serial::Result<()> {
            unreachable!()
        }
        fn read_cts(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_dsr(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_ri(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_cd(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MockPort;
    use super::*;

    #[test]
    fn command_frame_is_opcode_and_complement() {
        for op in &[
            constants::CMD_GET_ID,
            constants::CMD_READ_MEMORY,
            constants::CMD_GO,
            constants::CMD_WRITE_MEMORY,
            constants::CMD_ERASE_MEMORY_EXT,
        ] {
            let frame = command_frame(*op);
            assert_eq!(frame[0], *op);
            assert_eq!(frame[1], *op ^ 0xFF);
        }
    }

    #[test]
    fn address_frame_is_big_endian_with_xor() {
        let frame = address_frame(0x0800_0000);
        assert_eq!(frame, [0x08, 0x00, 0x00, 0x00, 0x08]);

        for addr in &[0u32, 0x0800_0188, 0xDEAD_BEEF, u32::MAX] {
            let frame = address_frame(*addr);
            assert_eq!(
                u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]),
                *addr
            );
            assert_eq!(frame[4], frame[0] ^ frame[1] ^ frame[2] ^ frame[3]);
        }
    }

    #[test]
    fn init_happy_path_consumes_exactly_one_byte() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[constants::ACK]));
        bl.init().unwrap();
        assert_eq!(bl.port.tx, vec![constants::INIT]);
        assert!(bl.port.rx.is_empty());
    }

    #[test]
    fn init_nack() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[constants::NACK]));
        assert!(matches!(bl.init(), Err(Error::Nack)));
    }

    #[test]
    fn init_silence_is_no_ack() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[]));
        assert!(matches!(bl.init(), Err(Error::NoAck)));
    }

    #[test]
    fn init_garbage_is_unknown_response() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[0x42]));
        assert!(matches!(bl.init(), Err(Error::UnknownResponse(0x42))));
    }

    #[test]
    fn get_id_returns_product_id() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[
            constants::ACK,
            0x01,
            0x04,
            0x13,
            constants::ACK,
        ]));
        assert_eq!(bl.get_id().unwrap(), 0x0413);
        assert_eq!(bl.port.tx, vec![0x02, 0xFD]);
        assert!(bl.port.rx.is_empty());
    }

    #[test]
    fn read_memory_frames_and_reads_n_bytes() {
        let mut rx = vec![constants::ACK, constants::ACK, constants::ACK];
        rx.extend_from_slice(&[0x00, 0x12, 0x00, 0x00]);

        let mut bl = Bootloader::new(MockPort::with_rx(&rx));
        let mut data = [0u8; 4];
        bl.read_memory(0x0800_0188, &mut data).unwrap();

        assert_eq!(data, [0x00, 0x12, 0x00, 0x00]);
        assert_eq!(
            bl.port.tx,
            vec![
                0x11, 0xEE, // command frame
                0x08, 0x00, 0x01, 0x88, 0x81, // address frame
                0x03, 0xFC, // N-1 and complement
            ]
        );
    }

    #[test]
    fn read_memory_rejects_empty_and_oversized() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[]));
        let mut none: [u8; 0] = [];
        assert!(matches!(
            bl.read_memory(0, &mut none),
            Err(Error::TransferLength(0))
        ));

        let mut big = [0u8; 257];
        assert!(matches!(
            bl.read_memory(0, &mut big),
            Err(Error::TransferLength(257))
        ));

        // Nothing went on the wire.
        assert!(bl.port.tx.is_empty());
    }

    #[test]
    fn write_memory_builds_single_buffer_with_checksum() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[
            constants::ACK,
            constants::ACK,
            constants::ACK,
        ]));
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        bl.write_memory(0x0800_0100, &data).unwrap();

        let tx = &bl.port.tx;
        assert_eq!(&tx[..2], &[0x31, 0xCE]);
        assert_eq!(&tx[2..7], &[0x08, 0x00, 0x01, 0x00, 0x09]);
        assert_eq!(tx[7], 0x07); // N-1
        assert_eq!(&tx[8..16], &data[..]);
        let checksum = data.iter().fold(0x07u8, |acc, b| acc ^ *b);
        assert_eq!(tx[16], checksum);
        assert_eq!(tx.len(), 17);
    }

    #[test]
    fn write_memory_requires_word_alignment() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[]));
        assert!(matches!(
            bl.write_memory(0x0800_0000, &[0u8; 3]),
            Err(Error::TransferLength(3))
        ));
    }

    #[test]
    fn write_memory_nack_on_address_aborts() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[constants::ACK, constants::NACK]));
        assert!(matches!(
            bl.write_memory(0x0800_0000, &[0u8; 4]),
            Err(Error::Nack)
        ));
        // Command and address frames went out, the data frame did not.
        assert_eq!(bl.port.tx.len(), 7);
    }

    #[test]
    fn mass_erase_sends_extended_command_and_special_code() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[constants::ACK, constants::ACK]));
        bl.mass_erase().unwrap();
        assert_eq!(bl.port.tx, vec![0x44, 0xBB, 0xFF, 0xFF, 0x00]);
        assert!(bl.port.rx.is_empty());
    }

    #[test]
    fn go_does_not_wait_for_second_ack() {
        // Only one ACK scripted: the one after the command frame. If the
        // engine tried to read another it would hit NoAck.
        let mut bl = Bootloader::new(MockPort::with_rx(&[constants::ACK]));
        bl.go(constants::FLASH_BASE).unwrap();
        assert_eq!(bl.port.tx, vec![0x21, 0xDE, 0x08, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn read_some_maps_timeout_to_zero() {
        let mut bl = Bootloader::new(MockPort::with_rx(&[]));
        let mut buf = [0u8; 16];
        assert_eq!(bl.read_some(&mut buf).unwrap(), 0);
    }
}
