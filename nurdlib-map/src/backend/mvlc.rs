//! Network-attached controller proxy: serializes single-cycle and block
//! transfers over a TCP stream to an MVLC-style bridge process. The wire
//! format is a minimal length-prefixed request/response pair; framing is
//! not meant to be a public protocol, just a stand-in for "somewhere else
//! on the network does the actual VME cycle".

use super::Backend;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const OP_SICY_READ: u8 = 1;
const OP_SICY_WRITE: u8 = 2;
const OP_BLT_READ: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_BUS_ERROR: u8 = 1;
const STATUS_DRIVER_ERROR: u8 = 2;

pub struct MvlcBackend {
    stream: TcpStream,
    base: u32,
}

impl MvlcBackend {
    pub fn connect(addr: SocketAddr, base: u32, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self { stream, base })
    }

    fn request(&mut self, op: u8, offset: usize, bits: u8, extra: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(10 + extra.len());
        frame.push(op);
        frame.extend_from_slice(&(self.base as usize + offset).to_be_bytes()[4..]);
        frame.push(bits);
        frame.extend_from_slice(&(extra.len() as u32).to_be_bytes());
        frame.extend_from_slice(extra);
        self.stream.write_all(&frame)?;

        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status)?;
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        match status[0] {
            STATUS_OK => Ok(payload),
            STATUS_BUS_ERROR => Err(Error::BusError(offset)),
            STATUS_DRIVER_ERROR => Err(Error::Driver(-1)),
            other => Err(Error::Driver(other as i32)),
        }
    }
}

impl Backend for MvlcBackend {
    fn sicy_read(&mut self, bits: u8, offset: usize) -> Result<u32> {
        let payload = self.request(OP_SICY_READ, offset, bits, &[])?;
        let width = super::bits_to_bytes(bits);
        let mut raw = [0u8; 4];
        raw[4 - width..].copy_from_slice(&payload[..width]);
        Ok(u32::from_be_bytes(raw))
    }

    fn sicy_write(&mut self, bits: u8, offset: usize, value: u32) -> Result<()> {
        let width = super::bits_to_bytes(bits);
        let raw = value.to_be_bytes();
        self.request(OP_SICY_WRITE, offset, bits, &raw[4 - width..])?;
        Ok(())
    }

    fn blt_read(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let len = (dst.len() as u32).to_be_bytes();
        let payload = self.request(OP_BLT_READ, offset, 32, &len)?;
        let n = payload.len().min(dst.len());
        dst[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    fn blt_read_berr(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        match self.blt_read(offset, dst) {
            Err(Error::BusError(_)) => Ok(0),
            other => other,
        }
    }
}
