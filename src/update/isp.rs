//! In-system programming over the NXP LPC2000 serial bootloader.
//!
//! The bootloader speaks a line protocol at a lower baud rate than the
//! runtime firmware: autobaud sync, then `W`rite to RAM with uuencoded data,
//! `P`repare/`E`rase the target sector and `C`opy RAM into flash.
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};

use super::models::{UpdateError, UpdateResult};
use crate::serial::interface::{BoxedSerial, PortOpener, PROGRAMMING_BAUD_RATE};

/// Start of the on-chip RAM area the bootloader leaves free for staging.
pub const RAM_BUFFER: u32 = 0x4000_0200;
pub const DEFAULT_CRYSTAL_KHZ: u32 = 11_059;
const UNLOCK_CODE: u32 = 23_130;
const BLOCK_SIZE: usize = 256;
const UU_LINE_BYTES: usize = 45;
const LINES_PER_CHECKSUM: usize = 20;

/// Drives a device that has been reset into its bootloader.
#[async_trait]
pub trait Programmer: Send {
    async fn open(&mut self) -> UpdateResult<()>;

    /// Establish communication; must succeed before programming.
    async fn handshake(&mut self) -> UpdateResult<()>;

    /// Write `data` to flash starting at `address`.
    async fn program(&mut self, address: u32, data: &[u8]) -> UpdateResult<()>;

    /// Finish any outstanding writes and release the port.
    async fn close(&mut self) -> UpdateResult<()>;
}

pub struct LpcIsp {
    opener: Box<dyn PortOpener>,
    baud_rate: u32,
    crystal_khz: u32,
    response_timeout: Duration,
    port: Option<BufStream<BoxedSerial>>,
    echo: bool,
    erased: BTreeSet<u32>,
    written: BTreeSet<u32>,
    // Last block touched; a later segment may still fill in the rest of it.
    staged: Option<StagedBlock>,
}

struct StagedBlock {
    address: u32,
    data: [u8; BLOCK_SIZE],
}

impl LpcIsp {
    pub fn new(opener: Box<dyn PortOpener>) -> Self {
        Self {
            opener,
            baud_rate: PROGRAMMING_BAUD_RATE,
            crystal_khz: DEFAULT_CRYSTAL_KHZ,
            response_timeout: Duration::from_secs(2),
            port: None,
            echo: true,
            erased: BTreeSet::new(),
            written: BTreeSet::new(),
            staged: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_crystal_khz(mut self, crystal_khz: u32) -> Self {
        self.crystal_khz = crystal_khz;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    fn port(&mut self) -> UpdateResult<&mut BufStream<BoxedSerial>> {
        self.port
            .as_mut()
            .ok_or_else(|| UpdateError::Isp("bootloader port is not open".into()))
    }

    async fn write_raw(&mut self, data: &[u8]) -> UpdateResult<()> {
        let port = self.port()?;
        port.write_all(data).await?;
        port.flush().await?;
        Ok(())
    }

    /// Next non-empty line from the bootloader.
    async fn read_line(&mut self) -> UpdateResult<String> {
        let timeout = self.response_timeout;
        let port = self.port()?;
        loop {
            let mut buf = Vec::new();
            let n = tokio::time::timeout(timeout, port.read_until(b'\n', &mut buf))
                .await
                .map_err(|_| UpdateError::Isp(format!("no reply from bootloader within {:?}", timeout)))??;
            if n == 0 {
                return Err(UpdateError::Isp("bootloader closed the port".into()));
            }
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }

    /// Send `text`, skip its echo, and return the reply line.
    async fn exchange(&mut self, text: &str) -> UpdateResult<String> {
        log::debug!("isp -> {}", text);
        self.write_raw(format!("{}\r\n", text).as_bytes()).await?;
        if self.echo {
            let echoed = self.read_line().await?;
            if echoed != text {
                log::debug!("isp echoed '{}' for '{}'", echoed, text);
            }
        }
        let reply = self.read_line().await?;
        log::debug!("isp <- {}", reply);
        Ok(reply)
    }

    async fn expect(&mut self, text: &str, expected: &str) -> UpdateResult<()> {
        let reply = self.exchange(text).await?;
        if reply == expected {
            Ok(())
        } else {
            Err(UpdateError::Isp(format!("'{}' answered '{}', expected '{}'", text, reply, expected)))
        }
    }

    /// Run a command that answers with a numeric return code.
    async fn command(&mut self, text: &str) -> UpdateResult<()> {
        let reply = self.exchange(text).await?;
        match reply.as_str() {
            "0" => Ok(()),
            code => Err(UpdateError::Isp(format!("'{}' failed: {}", text, describe_code(code)))),
        }
    }

    /// Copy a finished block into flash. Each block is written at most once
    /// per session since flash cannot be rewritten without erasing.
    async fn flush_block(&mut self, mut block: StagedBlock) -> UpdateResult<()> {
        if block.address == 0 {
            patch_vector_checksum(&mut block.data);
        }
        self.write_block(block.address, &block.data).await?;
        self.written.insert(block.address);
        Ok(())
    }

    async fn stage(&mut self, address: u32, data: &[u8]) -> UpdateResult<()> {
        let end = address
            .checked_add(data.len() as u32)
            .ok_or_else(|| UpdateError::Isp(format!("segment at 0x{:08x} overflows", address)))?;
        let mut block_address = address & !(BLOCK_SIZE as u32 - 1);
        while block_address < end {
            let mut block = match self.staged.take() {
                Some(staged) if staged.address == block_address => staged,
                other => {
                    if let Some(previous) = other {
                        self.flush_block(previous).await?;
                    }
                    if self.written.contains(&block_address) {
                        return Err(UpdateError::Isp(format!(
                            "block 0x{:08x} is already programmed",
                            block_address
                        )));
                    }
                    StagedBlock { address: block_address, data: [0xFF; BLOCK_SIZE] }
                }
            };
            let lo = block_address.max(address);
            let hi = block_address.saturating_add(BLOCK_SIZE as u32).min(end);
            block.data[(lo - block_address) as usize..(hi - block_address) as usize]
                .copy_from_slice(&data[(lo - address) as usize..(hi - address) as usize]);
            self.staged = Some(block);
            block_address += BLOCK_SIZE as u32;
        }
        Ok(())
    }

    async fn write_block(&mut self, address: u32, block: &[u8; BLOCK_SIZE]) -> UpdateResult<()> {
        self.command(&format!("W {} {}", RAM_BUFFER, BLOCK_SIZE)).await?;
        for group in block.chunks(UU_LINE_BYTES * LINES_PER_CHECKSUM) {
            for line in group.chunks(UU_LINE_BYTES) {
                self.write_raw(format!("{}\r\n", uuencode_line(line)).as_bytes())
                    .await?;
            }
            let checksum: u32 = group.iter().map(|b| *b as u32).sum();
            let reply = self.exchange(&checksum.to_string()).await?;
            if reply != "OK" {
                return Err(UpdateError::Isp(format!("RAM write checksum rejected: {}", reply)));
            }
        }

        let sector = sector_for(address);
        if !self.erased.contains(&sector) {
            log::debug!("Erasing sector {}", sector);
            self.command(&format!("P {} {}", sector, sector)).await?;
            self.command(&format!("E {} {}", sector, sector)).await?;
            self.erased.insert(sector);
        }
        self.command(&format!("P {} {}", sector, sector)).await?;
        self.command(&format!("C {} {} {}", address, RAM_BUFFER, BLOCK_SIZE))
            .await
    }
}

#[async_trait]
impl Programmer for LpcIsp {
    async fn open(&mut self) -> UpdateResult<()> {
        let port = self.opener.open(self.baud_rate).await?;
        self.port = Some(BufStream::new(port));
        self.echo = true;
        self.erased.clear();
        self.written.clear();
        self.staged = None;
        log::info!("Opened bootloader on {} at {} baud", self.opener.describe(), self.baud_rate);
        Ok(())
    }

    async fn handshake(&mut self) -> UpdateResult<()> {
        self.write_raw(b"?").await?;
        let reply = self.read_line().await?;
        if reply != "Synchronized" {
            return Err(UpdateError::Isp(format!("autobaud answered '{}'", reply)));
        }
        self.expect("Synchronized", "OK").await?;
        let crystal = self.crystal_khz.to_string();
        self.expect(&crystal, "OK").await?;
        self.command("A 0").await?;
        self.echo = false;
        self.command(&format!("U {}", UNLOCK_CODE)).await?;
        log::info!("Bootloader synchronized");
        Ok(())
    }

    /// Blocks are buffered until the next block is touched, so segments that
    /// share a 256-byte block land in a single copy. The last block goes out
    /// on [`Programmer::close`].
    async fn program(&mut self, address: u32, data: &[u8]) -> UpdateResult<()> {
        if let Err(e) = self.stage(address, data).await {
            self.staged = None;
            return Err(e);
        }
        log::debug!("{} bytes staged for flash at 0x{:08x}", data.len(), address);
        Ok(())
    }

    async fn close(&mut self) -> UpdateResult<()> {
        let flushed = match self.staged.take() {
            Some(block) if self.port.is_some() => self.flush_block(block).await,
            _ => Ok(()),
        };
        if let Some(mut port) = self.port.take() {
            port.shutdown().await?;
            log::info!("Closed bootloader port");
        }
        flushed
    }
}

/// Encode up to 45 bytes as one uuencoded line, using '`' for zero.
pub fn uuencode_line(data: &[u8]) -> String {
    fn uu_char(v: u8) -> char {
        if v == 0 {
            '`'
        } else {
            (v + 0x20) as char
        }
    }

    let mut out = String::with_capacity(1 + data.len().div_ceil(3) * 4);
    out.push(uu_char(data.len() as u8));
    for group in data.chunks(3) {
        let b0 = group[0];
        let b1 = group.get(1).copied().unwrap_or(0);
        let b2 = group.get(2).copied().unwrap_or(0);
        out.push(uu_char(b0 >> 2));
        out.push(uu_char(((b0 & 0x03) << 4) | (b1 >> 4)));
        out.push(uu_char(((b1 & 0x0F) << 2) | (b2 >> 6)));
        out.push(uu_char(b2 & 0x3F));
    }
    out
}

/// Flash sector holding `address` on LPC213x parts: eight 4K sectors, then
/// 32K sectors, then 4K sectors again from 0x78000.
pub fn sector_for(address: u32) -> u32 {
    if address < 0x8000 {
        address / 0x1000
    } else if address < 0x7_8000 {
        8 + (address - 0x8000) / 0x8000
    } else {
        22 + (address - 0x7_8000) / 0x1000
    }
}

/// The boot ROM only starts user code whose eight exception vectors sum to
/// zero; word 5 is reserved for the balancing value.
pub fn patch_vector_checksum(block: &mut [u8]) {
    let word = |block: &[u8], i: usize| {
        u32::from_le_bytes([block[i * 4], block[i * 4 + 1], block[i * 4 + 2], block[i * 4 + 3]])
    };
    let sum = (0..8)
        .filter(|&i| i != 5)
        .fold(0u32, |acc, i| acc.wrapping_add(word(block, i)));
    block[20..24].copy_from_slice(&0u32.wrapping_sub(sum).to_le_bytes());
}

fn describe_code(code: &str) -> String {
    let name = match code {
        "1" => "INVALID_COMMAND",
        "2" => "SRC_ADDR_ERROR",
        "3" => "DST_ADDR_ERROR",
        "4" => "SRC_ADDR_NOT_MAPPED",
        "5" => "DST_ADDR_NOT_MAPPED",
        "6" => "COUNT_ERROR",
        "7" => "INVALID_SECTOR",
        "8" => "SECTOR_NOT_BLANK",
        "9" => "SECTOR_NOT_PREPARED_FOR_WRITE_OPERATION",
        "10" => "COMPARE_ERROR",
        "11" => "BUSY",
        "12" => "PARAM_ERROR",
        "13" => "ADDR_ERROR",
        "14" => "ADDR_NOT_MAPPED",
        "15" => "CMD_LOCKED",
        "16" => "INVALID_CODE",
        "17" => "INVALID_BAUD_RATE",
        "18" => "INVALID_STOP_BIT",
        "19" => "CODE_READ_PROTECTION_ENABLED",
        other => return format!("unexpected reply '{}'", other),
    };
    format!("{} ({})", name, code)
}
