/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use pcap::{Active, Capture, Offline};
use serde::Serialize;

use super::{Error, Result};
use crate::common::{header, timeval_to_micros, LinkType};

pub struct Packet<'a> {
    // micros
    pub timestamp: u64,
    pub data: &'a [u8],
    pub link_type: LinkType,
}

pub enum Next<'a> {
    Packet(Packet<'a>),
    // nothing ready yet, the caller should check for shutdown and retry
    Idle,
    Exhausted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub received: u64,
    pub dropped: u64,
    pub if_dropped: u64,
}

pub trait PacketSource: Send {
    fn next_packet(&mut self) -> Result<Next<'_>>;
    fn stats(&mut self) -> Result<SourceStats>;
    fn is_file(&self) -> bool;
}

// waits up to `timeout` for `fd` to become readable, an interrupted wait
// counts as idle too
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<()> {
    let timeout = timeout.as_millis().min(i32::MAX as u128) as i32;
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn link_type_of(dlt: i32) -> Result<LinkType> {
    LinkType::from_dlt(dlt).ok_or(Error::Header(header::Error::UnsupportedLinkType(dlt)))
}

/// Reads a pcap file to the end.
pub struct PcapFileSource {
    capture: Capture<Offline>,
    link_type: LinkType,
    received: u64,
}

impl PcapFileSource {
    pub fn open<P: AsRef<Path>>(path: P, filter: &str) -> Result<Self> {
        let mut capture = Capture::from_file(path.as_ref())?;
        if !filter.is_empty() {
            capture.filter(filter, true)?;
        }
        let link_type = link_type_of(capture.get_datalink().0)?;
        info!(
            "reading {} with link type {:?}",
            path.as_ref().display(),
            link_type
        );
        Ok(Self {
            capture,
            link_type,
            received: 0,
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Next<'_>> {
        let link_type = self.link_type;
        match self.capture.next() {
            Ok(packet) => {
                self.received += 1;
                Ok(Next::Packet(Packet {
                    timestamp: timeval_to_micros(
                        packet.header.ts.tv_sec as i64,
                        packet.header.ts.tv_usec as i64,
                    ),
                    data: packet.data,
                    link_type,
                }))
            }
            Err(pcap::Error::NoMorePackets) => Ok(Next::Exhausted),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&mut self) -> Result<SourceStats> {
        Ok(SourceStats {
            received: self.received,
            ..Default::default()
        })
    }

    fn is_file(&self) -> bool {
        true
    }
}

/// Captures from a network device in non-blocking mode, polling its
/// descriptor when no packet is buffered.
pub struct PcapLiveSource {
    capture: Capture<Active>,
    fd: RawFd,
    link_type: LinkType,
    poll_timeout: Duration,
}

impl PcapLiveSource {
    pub fn open(device: &str, filter: &str, snaplen: u32, poll_timeout: Duration) -> Result<Self> {
        let timeout_ms = poll_timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut capture = Capture::from_device(device)?
            .promisc(true)
            .snaplen(snaplen.min(i32::MAX as u32) as i32)
            .timeout(timeout_ms)
            .open()?
            .setnonblock()?;
        if !filter.is_empty() {
            capture.filter(filter, true)?;
        }
        let link_type = link_type_of(capture.get_datalink().0)?;
        let fd = capture.as_raw_fd();
        info!("capturing on {} with link type {:?}", device, link_type);
        Ok(Self {
            capture,
            fd,
            link_type,
            poll_timeout,
        })
    }
}

impl PacketSource for PcapLiveSource {
    fn next_packet(&mut self) -> Result<Next<'_>> {
        let link_type = self.link_type;
        match self.capture.next() {
            Ok(packet) => Ok(Next::Packet(Packet {
                timestamp: timeval_to_micros(
                    packet.header.ts.tv_sec as i64,
                    packet.header.ts.tv_usec as i64,
                ),
                data: packet.data,
                link_type,
            })),
            Err(pcap::Error::TimeoutExpired) => {
                wait_readable(self.fd, self.poll_timeout)?;
                Ok(Next::Idle)
            }
            Err(pcap::Error::NoMorePackets) => Ok(Next::Exhausted),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&mut self) -> Result<SourceStats> {
        let stat = self.capture.stats()?;
        Ok(SourceStats {
            received: stat.received as u64,
            dropped: stat.dropped as u64,
            if_dropped: stat.if_dropped as u64,
        })
    }

    fn is_file(&self) -> bool {
        false
    }
}

/// Replays packets held in memory, then reports exhaustion.
pub struct MemorySource {
    pending: VecDeque<(u64, Vec<u8>)>,
    current: Vec<u8>,
    link_type: LinkType,
    received: u64,
    idle_gap: usize,
    idle_left: usize,
}

impl MemorySource {
    pub fn new(link_type: LinkType, packets: Vec<(u64, Vec<u8>)>) -> Self {
        Self {
            pending: packets.into(),
            current: vec![],
            link_type,
            received: 0,
            idle_gap: 0,
            idle_left: 0,
        }
    }

    /// Reports `gap` idle polls before every packet, like a quiet device.
    pub fn with_idle_gaps(mut self, gap: usize) -> Self {
        self.idle_gap = gap;
        self.idle_left = gap;
        self
    }
}

impl PacketSource for MemorySource {
    fn next_packet(&mut self) -> Result<Next<'_>> {
        if self.idle_left > 0 && !self.pending.is_empty() {
            self.idle_left -= 1;
            return Ok(Next::Idle);
        }
        match self.pending.pop_front() {
            Some((timestamp, data)) => {
                self.received += 1;
                self.idle_left = self.idle_gap;
                self.current = data;
                Ok(Next::Packet(Packet {
                    timestamp,
                    data: &self.current,
                    link_type: self.link_type,
                }))
            }
            None => {
                debug!("memory source exhausted after {} packets", self.received);
                Ok(Next::Exhausted)
            }
        }
    }

    fn stats(&mut self) -> Result<SourceStats> {
        Ok(SourceStats {
            received: self.received,
            ..Default::default()
        })
    }

    fn is_file(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn memory_source_replays_in_order() {
        let mut source = MemorySource::new(
            LinkType::Raw,
            vec![(5, vec![1, 2]), (9, vec![3])],
        );
        let mut seen = vec![];
        loop {
            match source.next_packet().unwrap() {
                Next::Packet(p) => seen.push((p.timestamp, p.data.to_vec())),
                Next::Idle => continue,
                Next::Exhausted => break,
            }
        }
        assert_eq!(seen, vec![(5, vec![1, 2]), (9, vec![3])]);
        assert_eq!(source.stats().unwrap().received, 2);
        assert!(source.is_file());
    }

    #[test]
    fn memory_source_idle_gaps() {
        let mut source =
            MemorySource::new(LinkType::Raw, vec![(1, vec![1]), (2, vec![2])]).with_idle_gaps(2);
        let mut events = vec![];
        loop {
            match source.next_packet().unwrap() {
                Next::Packet(p) => events.push(p.timestamp),
                Next::Idle => events.push(0),
                Next::Exhausted => break,
            }
        }
        assert_eq!(events, vec![0, 0, 1, 0, 0, 2]);
    }

    #[test]
    fn idle_poll_returns_on_timeout_and_data() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let start = std::time::Instant::now();
        wait_readable(rx, Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));

        nix::unistd::write(tx, &[1]).unwrap();
        let start = std::time::Instant::now();
        wait_readable(rx, Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        nix::unistd::close(rx).unwrap();
        nix::unistd::close(tx).unwrap();
    }

    fn write_pcap(file: &mut impl Write, packets: &[(u32, u32, &[u8])]) {
        // classic pcap, microsecond resolution, ethernet
        file.write_all(&0xa1b2c3d4u32.to_le_bytes()).unwrap();
        file.write_all(&2u16.to_le_bytes()).unwrap();
        file.write_all(&4u16.to_le_bytes()).unwrap();
        file.write_all(&0i32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(&65535u32.to_le_bytes()).unwrap();
        file.write_all(&1u32.to_le_bytes()).unwrap();
        for (sec, usec, data) in packets {
            file.write_all(&sec.to_le_bytes()).unwrap();
            file.write_all(&usec.to_le_bytes()).unwrap();
            file.write_all(&(data.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&(data.len() as u32).to_le_bytes()).unwrap();
            file.write_all(data).unwrap();
        }
    }

    #[test]
    fn pcap_file_source() {
        let frame = [0u8; 60];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_pcap(&mut file, &[(1, 250, &frame), (2, 0, &frame)]);
        file.flush().unwrap();

        let mut source = PcapFileSource::open(file.path(), "").unwrap();
        let mut timestamps = vec![];
        while let Next::Packet(p) = source.next_packet().unwrap() {
            assert_eq!(p.link_type, LinkType::Ethernet);
            assert_eq!(p.data.len(), 60);
            timestamps.push(p.timestamp);
        }
        assert_eq!(timestamps, vec![1_000_250, 2_000_000]);
        assert_eq!(source.stats().unwrap().received, 2);
    }

    #[test]
    fn missing_pcap_file() {
        assert!(matches!(
            PcapFileSource::open("/nonexistent/trace.pcap", ""),
            Err(Error::Pcap(_))
        ));
    }
}
