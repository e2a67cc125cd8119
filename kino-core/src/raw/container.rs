//! # KRAW Container
//!
//! Length-prefixed container used by the reference backend.
//!
//! ```text
//! "KRAW" | u16 version | u32 len | JSON header (streams, metadata, chapters)
//! records:
//!   0x01 | u32 stream | i64 pts | i64 dts | i64 duration | u8 flags | u32 len | payload
//!   0x02 | u32 len | JSON trailer (duration, packet counts)
//! ```
//!
//! All integers are little endian. Packet timestamps are in the time base
//! of their stream. The demuxer indexes every record at open, so seeking
//! is a lookup of the reference stream's key frames.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, CodecResult, Demuxer, Muxer, SeekDirection};
use crate::error::{MediaError, Result};
use crate::media::{Chapter, MediaType, Packet, Rational, StreamInfo};

pub const MAGIC: &[u8; 4] = b"KRAW";
pub const VERSION: u16 = 1;
pub const FORMAT_NAME: &str = "kraw";

const TAG_PACKET: u8 = 0x01;
const TAG_TRAILER: u8 = 0x02;

/// Packets held back for dts interleaving before the oldest is forced out.
const MAX_INTERLEAVE_BUFFERED: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    streams: Vec<StreamInfo>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Trailer {
    duration_us: i64,
    packets: Vec<u64>,
}

// ============================================================================
// Demuxer
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    len: u32,
    stream: usize,
    pts: i64,
    dts: i64,
    duration: i64,
    flags: u8,
}

pub struct KrawDemuxer {
    reader: BufReader<File>,
    streams: Vec<StreamInfo>,
    metadata: BTreeMap<String, String>,
    chapters: Vec<Chapter>,
    index: Vec<IndexEntry>,
    position: usize,
    duration_us: i64,
    total_bytes: u64,
}

impl KrawDemuxer {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| MediaError::open(path, e))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|e| MediaError::open(path, e))?;
        if &magic != MAGIC {
            return Err(MediaError::open(path, "not a KRAW file"));
        }
        let version = read_u16(&mut reader).map_err(|e| MediaError::open(path, e))?;
        if version != VERSION {
            return Err(MediaError::open(path, format!("unsupported KRAW version {}", version)));
        }
        let header: Header = read_json(&mut reader).map_err(|e| MediaError::open(path, e))?;

        let mut streams = header.streams;
        for (i, stream) in streams.iter_mut().enumerate() {
            stream.index = i;
        }

        let (index, trailer) = build_index(&mut reader, streams.len()).map_err(|e| MediaError::open(path, e))?;
        let total_bytes = index.iter().map(|e| e.len as u64).sum();

        let duration_us = match &trailer {
            Some(t) if t.duration_us > 0 => t.duration_us,
            _ => index
                .iter()
                .map(|e| streams[e.stream].time_base.to_micros(e.pts + e.duration))
                .max()
                .unwrap_or(0),
        };
        for stream in streams.iter_mut() {
            if stream.duration == 0 {
                let end = index
                    .iter()
                    .filter(|e| e.stream == stream.index)
                    .map(|e| e.pts + e.duration)
                    .max()
                    .unwrap_or(0);
                stream.duration = end;
            }
        }

        tracing::debug!(
            "KRAW opened: {} streams, {} packets, {}us",
            streams.len(),
            index.len(),
            duration_us
        );

        Ok(Self {
            reader,
            streams,
            metadata: header.metadata,
            chapters: header.chapters,
            index,
            position: 0,
            duration_us,
            total_bytes,
        })
    }

    pub fn packet_count(&self) -> usize {
        self.index.len()
    }

    /// Stream whose key frames seeking lands on.
    fn reference_stream(&self) -> Option<usize> {
        self.streams
            .iter()
            .find(|s| s.media_type == MediaType::Video)
            .or_else(|| self.streams.iter().find(|s| s.media_type == MediaType::Audio))
            .or_else(|| self.streams.first())
            .map(|s| s.index)
    }

    fn entry_us(&self, entry: &IndexEntry) -> i64 {
        self.streams[entry.stream].time_base.to_micros(entry.pts)
    }
}

fn build_index<R: Read + Seek>(reader: &mut R, stream_count: usize) -> std::io::Result<(Vec<IndexEntry>, Option<Trailer>)> {
    let start = reader.stream_position()?;
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(start))?;

    let mut index = Vec::new();
    loop {
        let mut tag = [0u8; 1];
        match reader.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok((index, None)),
            Err(e) => return Err(e),
        }
        match tag[0] {
            TAG_PACKET => {
                let stream = read_u32(reader)? as usize;
                let pts = read_i64(reader)?;
                let dts = read_i64(reader)?;
                let duration = read_i64(reader)?;
                let mut flags = [0u8; 1];
                reader.read_exact(&mut flags)?;
                let len = read_u32(reader)?;
                let offset = reader.stream_position()?;
                let left = file_len.saturating_sub(offset);
                if len as u64 > left {
                    return Err(overrun("packet", len, left));
                }
                reader.seek(SeekFrom::Current(len as i64))?;
                if stream >= stream_count {
                    tracing::debug!("KRAW: packet for unknown stream {} skipped", stream);
                    continue;
                }
                index.push(IndexEntry {
                    offset,
                    len,
                    stream,
                    pts,
                    dts,
                    duration,
                    flags: flags[0],
                });
            }
            TAG_TRAILER => {
                let trailer: Trailer = read_json(reader)?;
                return Ok((index, Some(trailer)));
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown record tag {:#04x}", other),
                ))
            }
        }
    }
}

impl Demuxer for KrawDemuxer {
    fn format_name(&self) -> &str {
        FORMAT_NAME
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration_us(&self) -> i64 {
        self.duration_us
    }

    fn bit_rate(&self) -> u64 {
        if self.duration_us <= 0 {
            return 0;
        }
        (self.total_bytes as u128 * 8 * 1_000_000 / self.duration_us as u128) as u64
    }

    fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    fn read_packet(&mut self) -> CodecResult<Packet> {
        let Some(entry) = self.index.get(self.position).copied() else {
            return Err(CodecError::EndOfStream);
        };
        self.position += 1;

        let mut data = vec![0u8; entry.len as usize];
        self.reader
            .seek(SeekFrom::Start(entry.offset))
            .and_then(|_| self.reader.read_exact(&mut data))
            .map_err(|e| CodecError::Fatal(format!("read failed: {}", e)))?;

        Ok(Packet {
            stream_index: entry.stream,
            pts: entry.pts,
            dts: entry.dts,
            duration: entry.duration,
            time_base: self.streams[entry.stream].time_base,
            flags: entry.flags,
            data: Bytes::from(data),
        })
    }

    fn seek(&mut self, position_us: i64, direction: SeekDirection) -> CodecResult<()> {
        let Some(reference) = self.reference_stream() else {
            return Err(CodecError::Fatal("no streams to seek in".into()));
        };
        let keys = self
            .index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.stream == reference && e.flags & crate::media::PACKET_FLAG_KEY != 0);

        let target = match direction {
            SeekDirection::Backward => keys
                .filter(|(_, e)| self.entry_us(e) <= position_us)
                .map(|(i, _)| i)
                .last()
                .unwrap_or(0),
            SeekDirection::Forward => keys
                .filter(|(_, e)| self.entry_us(e) >= position_us)
                .map(|(i, _)| i)
                .next()
                .unwrap_or(self.index.len()),
        };
        tracing::debug!("KRAW: seek {}us {:?} -> record {}", position_us, direction, target);
        self.position = target;
        Ok(())
    }
}

// ============================================================================
// Muxer
// ============================================================================

pub struct KrawMuxer {
    path: PathBuf,
    writer: BufWriter<File>,
    streams: Vec<StreamInfo>,
    metadata: BTreeMap<String, String>,
    chapters: Vec<Chapter>,
    header_written: bool,
    pending: Vec<VecDeque<Packet>>,
    last_dts: Vec<Option<i64>>,
    packets: Vec<u64>,
    end_us: i64,
}

impl KrawMuxer {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| MediaError::open(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            streams: Vec::new(),
            metadata: BTreeMap::new(),
            chapters: Vec::new(),
            header_written: false,
            pending: Vec::new(),
            last_dts: Vec::new(),
            packets: Vec::new(),
            end_us: 0,
        })
    }

    fn pending_total(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    /// Write the buffered packet with the smallest dts while every stream
    /// has one queued, or while the buffer is over its bound. `all` empties it.
    fn flush_interleaved(&mut self, all: bool) -> Result<()> {
        loop {
            let total = self.pending_total();
            if total == 0 {
                return Ok(());
            }
            let every_stream_ready = self.pending.iter().all(|q| !q.is_empty());
            if !(all || every_stream_ready || total > MAX_INTERLEAVE_BUFFERED) {
                return Ok(());
            }

            let next = self
                .pending
                .iter()
                .enumerate()
                .filter_map(|(i, q)| q.front().map(|p| (i, p.time_base.to_micros(p.dts))))
                .min_by_key(|(_, dts)| *dts)
                .map(|(i, _)| i);
            let Some(stream) = next else {
                return Ok(());
            };
            if let Some(packet) = self.pending[stream].pop_front() {
                self.write_packet(&packet)?;
            }
        }
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut record = Vec::with_capacity(34 + packet.data.len());
        record.push(TAG_PACKET);
        record.extend_from_slice(&(packet.stream_index as u32).to_le_bytes());
        record.extend_from_slice(&packet.pts.to_le_bytes());
        record.extend_from_slice(&packet.dts.to_le_bytes());
        record.extend_from_slice(&packet.duration.to_le_bytes());
        record.push(packet.flags);
        record.extend_from_slice(&(packet.data.len() as u32).to_le_bytes());
        record.extend_from_slice(&packet.data);
        self.writer.write_all(&record)?;

        self.packets[packet.stream_index] += 1;
        self.end_us = self.end_us.max(packet.time_base.to_micros(packet.pts + packet.duration));
        Ok(())
    }
}

impl Muxer for KrawMuxer {
    fn add_stream(&mut self, mut info: StreamInfo) -> Result<usize> {
        if self.header_written {
            return Err(MediaError::InvalidState("stream added after header".into()));
        }
        if !info.time_base.is_valid() {
            return Err(MediaError::Mux(format!("invalid time base {:?}", info.time_base)));
        }
        let index = self.streams.len();
        info.index = index;
        self.streams.push(info);
        self.pending.push(VecDeque::new());
        self.last_dts.push(None);
        self.packets.push(0);
        Ok(index)
    }

    fn set_metadata(&mut self, metadata: BTreeMap<String, String>) {
        self.metadata = metadata;
    }

    fn set_chapters(&mut self, chapters: Vec<Chapter>) {
        self.chapters = chapters;
    }

    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Err(MediaError::InvalidState("header already written".into()));
        }
        if self.streams.is_empty() {
            return Err(MediaError::Mux(format!("{}: no streams", self.path.display())));
        }
        let header = Header {
            streams: self.streams.clone(),
            metadata: self.metadata.clone(),
            chapters: self.chapters.clone(),
        };
        let json = serde_json::to_vec(&header).map_err(|e| MediaError::Mux(e.to_string()))?;

        self.writer.write_all(MAGIC)?;
        self.writer.write_all(&VERSION.to_le_bytes())?;
        self.writer.write_all(&(json.len() as u32).to_le_bytes())?;
        self.writer.write_all(&json)?;
        self.header_written = true;
        Ok(())
    }

    fn write_interleaved(&mut self, mut packet: Packet) -> Result<()> {
        if !self.header_written {
            return Err(MediaError::InvalidState("packet written before header".into()));
        }
        let Some(stream) = self.streams.get(packet.stream_index) else {
            return Err(MediaError::Mux(format!("no output stream {}", packet.stream_index)));
        };
        packet.rescale_ts(stream.time_base);

        let last = &mut self.last_dts[packet.stream_index];
        if let Some(previous) = *last {
            if packet.dts < previous {
                return Err(MediaError::Mux(format!(
                    "non-monotonic dts on stream {}: {} after {}",
                    packet.stream_index, packet.dts, previous
                )));
            }
        }
        *last = Some(packet.dts);

        self.pending[packet.stream_index].push_back(packet);
        self.flush_interleaved(false)
    }

    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(MediaError::InvalidState("trailer written before header".into()));
        }
        self.flush_interleaved(true)?;
        let trailer = Trailer {
            duration_us: self.end_us,
            packets: self.packets.clone(),
        };
        let json = serde_json::to_vec(&trailer).map_err(|e| MediaError::Mux(e.to_string()))?;
        self.writer.write_all(&[TAG_TRAILER])?;
        self.writer.write_all(&(json.len() as u32).to_le_bytes())?;
        self.writer.write_all(&json)?;
        self.writer.flush()?;
        tracing::debug!("KRAW written: {} ({:?} packets)", self.path.display(), self.packets);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn read_u16<R: Read>(reader: &mut R) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn overrun(what: &str, len: u32, left: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{} of {} bytes runs past the end of the file ({} left)", what, len, left),
    )
}

fn read_json<R: Read + Seek, T: serde::de::DeserializeOwned>(reader: &mut R) -> std::io::Result<T> {
    let len = read_u32(reader)?;
    let pos = reader.stream_position()?;
    let left = reader.seek(SeekFrom::End(0))?.saturating_sub(pos);
    reader.seek(SeekFrom::Start(pos))?;
    if len as u64 > left {
        return Err(overrun("json block", len, left));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioFormat, ChannelLayout, PixelFormat, SampleFormat, VideoFormat};

    fn write_sample(path: &Path) {
        let mut mux = KrawMuxer::create(path).unwrap();
        let video = StreamInfo::video(0, "rawvideo", VideoFormat::new(PixelFormat::Gray8, 2, 2), Rational::new(25, 1));
        let audio = StreamInfo::audio(
            0,
            "pcm_s16le",
            AudioFormat::new(SampleFormat::S16, ChannelLayout::Mono, 8_000),
        );
        assert_eq!(mux.add_stream(video).unwrap(), 0);
        assert_eq!(mux.add_stream(audio).unwrap(), 1);
        mux.set_metadata(BTreeMap::from([("title".to_string(), "sample".to_string())]));
        mux.write_header().unwrap();

        let vtb = Rational::new(1, 25);
        let atb = Rational::new(1, 8_000);
        for i in 0..10i64 {
            let key = i % 5 == 0;
            mux.write_interleaved(Packet::new(0, i, 1, vtb, Bytes::from(vec![i as u8; 4])).with_key_frame(key))
                .unwrap();
            mux.write_interleaved(Packet::new(1, i * 320, 320, atb, Bytes::from(vec![0u8; 640])).with_key_frame(true))
                .unwrap();
        }
        mux.write_trailer().unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.kraw");
        write_sample(&path);

        let mut demux = KrawDemuxer::open(&path).unwrap();
        assert_eq!(demux.streams().len(), 2);
        assert_eq!(demux.packet_count(), 20);
        assert_eq!(demux.duration_us(), 400_000);
        assert_eq!(demux.metadata().get("title").map(String::as_str), Some("sample"));
        assert!(demux.bit_rate() > 0);

        let mut last_us = i64::MIN;
        let mut video = 0;
        loop {
            match demux.read_packet() {
                Ok(p) => {
                    assert!(p.pts_us() >= last_us - 40_000);
                    last_us = last_us.max(p.pts_us());
                    if p.stream_index == 0 {
                        assert_eq!(p.data[0] as i64, p.pts);
                        video += 1;
                    }
                }
                Err(CodecError::EndOfStream) => break,
                Err(e) => panic!("{}", e),
            }
        }
        assert_eq!(video, 10);
    }

    #[test]
    fn test_seek_lands_on_key_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.kraw");
        write_sample(&path);
        let mut demux = KrawDemuxer::open(&path).unwrap();

        let first_video = |d: &mut KrawDemuxer| loop {
            let p = d.read_packet().unwrap();
            if p.stream_index == 0 {
                return p;
            }
        };

        demux.seek(300_000, SeekDirection::Backward).unwrap();
        let p = first_video(&mut demux);
        assert_eq!(p.pts, 5);
        assert!(p.is_key_frame());

        demux.seek(40_000, SeekDirection::Forward).unwrap();
        assert_eq!(first_video(&mut demux).pts, 5);

        demux.seek(390_000, SeekDirection::Forward).unwrap();
        assert_eq!(demux.read_packet().unwrap_err(), CodecError::EndOfStream);
    }

    #[test]
    fn test_packet_length_past_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.kraw");
        let mut mux = KrawMuxer::create(&path).unwrap();
        mux.add_stream(StreamInfo::subtitle(0, "text")).unwrap();
        mux.write_header().unwrap();
        mux.write_trailer().unwrap();

        // Replace the trailer with a packet record claiming 4 GiB of payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let header_end = 4 + 2 + 4 + u32::from_le_bytes(bytes[6..10].try_into().unwrap()) as usize;
        bytes.truncate(header_end);
        bytes.push(TAG_PACKET);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        for _ in 0..3 {
            bytes.extend_from_slice(&0i64.to_le_bytes());
        }
        bytes.push(0);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        std::fs::write(&path, &bytes).unwrap();

        let err = KrawDemuxer::open(&path).err().unwrap();
        assert!(matches!(err, MediaError::Open { .. }));
        assert!(err.to_string().contains("past the end"), "{}", err);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.kraw");
        std::fs::write(&path, b"RIFF....").unwrap();
        assert!(matches!(KrawDemuxer::open(&path), Err(MediaError::Open { .. })));

        // Header length far beyond the file size.
        let mut huge_header = MAGIC.to_vec();
        huge_header.extend_from_slice(&VERSION.to_le_bytes());
        huge_header.extend_from_slice(&u32::MAX.to_le_bytes());
        huge_header.extend_from_slice(b"{}");
        std::fs::write(&path, &huge_header).unwrap();
        assert!(matches!(KrawDemuxer::open(&path), Err(MediaError::Open { .. })));

        let mut mux = KrawMuxer::create(&dir.path().join("d.kraw")).unwrap();
        assert!(mux.write_header().is_err());
        mux.add_stream(StreamInfo::subtitle(0, "text")).unwrap();
        mux.write_header().unwrap();
        let tb = Rational::new(1, 1000);
        mux.write_interleaved(Packet::new(0, 10, 1, tb, Bytes::from_static(b"a"))).unwrap();
        let err = mux.write_interleaved(Packet::new(0, 5, 1, tb, Bytes::from_static(b"b"))).unwrap_err();
        assert!(matches!(err, MediaError::Mux(_)));
    }
}
