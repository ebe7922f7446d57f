//! Capture file I/O (spec §6): a reader that sniffs PCAP vs PCAPNG and
//! normalizes both into a stream of [`PacketRecord`]s, and a writer that
//! emits whichever format the input file used.
//!
//! Grounded in the teacher's `proxy::dumper::Dumper`, which drives
//! `pcap_file::pcap::{PcapWriter, PcapPacket}` through a `NamedTempFile`
//! and persists atomically on success (`Dumper::save_pcap`). This module
//! adds the PCAPNG half spec §6 requires and a matching reader.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::blocks::Block;
use pcap_file::pcapng::{PcapNgReader, PcapNgWriter};
use pcap_file::DataLink;
use tempfile::NamedTempFile;

use crate::error::CaptureError;
use crate::model::{LinkType, PacketRecord};

/// Which on-disk container a file used. The writer mirrors whatever the
/// reader observed so output files stay in the same family as input
/// files (spec §6: "a writer must emit a file whose packet records are
/// bit-identical to inputs except where a stage has explicitly modified
/// them").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

const PCAP_MAGIC_LE: u32 = 0xA1B2C3D4;
const PCAP_MAGIC_BE: u32 = 0xD4C3B2A1;
const PCAP_MAGIC_NS_LE: u32 = 0xA1B23C4D;
const PCAP_MAGIC_NS_BE: u32 = 0x4D3CB2A1;
const PCAPNG_MAGIC: u32 = 0x0A0D0D0A;

fn sniff_format(path: &Path) -> Result<CaptureFormat, CaptureError> {
    let mut file = File::open(path).map_err(|source| CaptureError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut magic_bytes = [0u8; 4];
    file.read_exact(&mut magic_bytes)
        .map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let magic = u32::from_le_bytes(magic_bytes);
    match magic {
        PCAP_MAGIC_LE | PCAP_MAGIC_BE | PCAP_MAGIC_NS_LE | PCAP_MAGIC_NS_BE => {
            Ok(CaptureFormat::Pcap)
        }
        PCAPNG_MAGIC => Ok(CaptureFormat::PcapNg),
        _ => Err(CaptureError::UnrecognizedFormat(path.to_path_buf())),
    }
}

/// One link-type/snaplen per interface, as declared by a PCAPNG Interface
/// Description Block or synthesized from a legacy PCAP global header
/// (which only ever has a single, implicit interface).
#[derive(Debug, Clone)]
struct Interface {
    link_type: LinkType,
}

/// Reads a PCAP or PCAPNG file into a uniform stream of [`PacketRecord`],
/// preserving per-packet timestamp resolution and per-interface
/// link-layer type (spec §6).
pub struct CaptureReader {
    format: CaptureFormat,
    inner: ReaderInner,
}

enum ReaderInner {
    Pcap(PcapReader<BufReader<File>>),
    PcapNg(PcapNgReader<BufReader<File>>, Vec<Interface>),
}

impl CaptureReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let format = sniff_format(path)?;
        let file = File::open(path).map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);

        let inner = match format {
            CaptureFormat::Pcap => {
                let pcap_reader =
                    PcapReader::new(reader).map_err(|source| CaptureError::Pcap {
                        path: path.to_path_buf(),
                        source,
                    })?;
                ReaderInner::Pcap(pcap_reader)
            }
            CaptureFormat::PcapNg => {
                let ng_reader =
                    PcapNgReader::new(reader).map_err(|source| CaptureError::PcapNg {
                        path: path.to_path_buf(),
                        source,
                    })?;
                ReaderInner::PcapNg(ng_reader, Vec::new())
            }
        };

        Ok(CaptureReader { format, inner })
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Link type declared by the legacy PCAP global header; irrelevant
    /// for PCAPNG, where link type is per-interface.
    pub fn global_link_type(&self) -> Option<LinkType> {
        match &self.inner {
            ReaderInner::Pcap(reader) => {
                Some(LinkType(datalink_to_u32(reader.header().datalink)))
            }
            ReaderInner::PcapNg(_, _) => None,
        }
    }

    /// Pull the next packet, or `None` at end of file.
    pub fn next_packet(&mut self) -> Option<Result<PacketRecord, CaptureError>> {
        match &mut self.inner {
            ReaderInner::Pcap(reader) => reader.next_packet().map(|result| {
                result
                    .map(|packet: PcapPacket| {
                        let link_type = LinkType(datalink_to_u32(reader.header().datalink));
                        PacketRecord::new(
                            packet.timestamp,
                            packet.orig_len,
                            link_type,
                            packet.data.into_owned(),
                        )
                    })
                    .map_err(|source| CaptureError::Pcap {
                        path: PathBuf::new(),
                        source,
                    })
            }),
            ReaderInner::PcapNg(reader, interfaces) => loop {
                let block = reader.next_block()?;
                let block = match block {
                    Ok(block) => block,
                    Err(source) => {
                        return Some(Err(CaptureError::PcapNg {
                            path: PathBuf::new(),
                            source,
                        }));
                    }
                };

                match block {
                    Block::InterfaceDescription(idb) => {
                        interfaces.push(Interface {
                            link_type: LinkType(datalink_to_u32(idb.linktype)),
                        });
                    }
                    Block::EnhancedPacket(epb) => {
                        let link_type = interfaces
                            .get(epb.interface_id as usize)
                            .map(|iface| iface.link_type)
                            .unwrap_or(LinkType::ETHERNET);
                        return Some(Ok(PacketRecord::new(
                            epb.timestamp,
                            epb.original_len,
                            link_type,
                            epb.data.into_owned(),
                        )));
                    }
                    Block::SimplePacket(spb) => {
                        let link_type = interfaces
                            .first()
                            .map(|iface| iface.link_type)
                            .unwrap_or(LinkType::ETHERNET);
                        return Some(Ok(PacketRecord::new(
                            std::time::Duration::ZERO,
                            spb.original_len,
                            link_type,
                            spb.data.into_owned(),
                        )));
                    }
                    // Section Header and Interface Statistics blocks carry
                    // no packet data; skip and keep reading.
                    _ => continue,
                }
            },
        }
    }
}

fn datalink_to_u32(link: DataLink) -> u32 {
    u32::from(link)
}

/// Writes a sequence of [`PacketRecord`]s to a temp file and persists it
/// atomically at `path` only on success — a failed file never leaves a
/// partial output (spec §7), matching `Dumper::save_pcap`'s persist with
/// cross-device-rename fallback.
pub struct CaptureWriter {
    format: CaptureFormat,
    tmp: NamedTempFile,
    inner: WriterInner,
}

enum WriterInner {
    Pcap(PcapWriter<BufWriter<File>>),
    PcapNg(PcapNgWriter<BufWriter<File>>, PcapNgInterfaces),
}

/// Tracks which link types have already been declared via an Interface
/// Description Block, so `write_packet` can lazily emit one the first
/// time a new link type is seen rather than requiring every caller to
/// call [`CaptureWriter::write_interface`] up front (spec §6: "a writer
/// must preserve per-interface link-layer type").
#[derive(Default)]
struct PcapNgInterfaces {
    ids_by_link_type: HashMap<u32, u32>,
}

impl CaptureWriter {
    pub fn create(format: CaptureFormat, global_link_type: LinkType) -> Result<Self, CaptureError> {
        let tmp = NamedTempFile::new().map_err(|source| CaptureError::Io {
            path: PathBuf::new(),
            source,
        })?;
        let file = tmp.reopen().map_err(|source| CaptureError::Io {
            path: PathBuf::new(),
            source,
        })?;
        let writer = BufWriter::new(file);

        let inner = match format {
            CaptureFormat::Pcap => {
                let header = PcapHeader {
                    datalink: DataLink::from(global_link_type.0),
                    ..PcapHeader::default()
                };
                let pcap_writer = PcapWriter::with_header(writer, header).map_err(|source| {
                    CaptureError::Pcap {
                        path: PathBuf::new(),
                        source,
                    }
                })?;
                WriterInner::Pcap(pcap_writer)
            }
            CaptureFormat::PcapNg => {
                let ng_writer = PcapNgWriter::new(writer).map_err(|source| CaptureError::PcapNg {
                    path: PathBuf::new(),
                    source,
                })?;
                WriterInner::PcapNg(ng_writer, PcapNgInterfaces::default())
            }
        };

        Ok(CaptureWriter { format, tmp, inner })
    }

    pub fn write_packet(&mut self, record: &PacketRecord) -> Result<(), CaptureError> {
        match &mut self.inner {
            WriterInner::Pcap(writer) => {
                let packet = PcapPacket {
                    timestamp: record.timestamp,
                    orig_len: record.original_len,
                    data: std::borrow::Cow::Borrowed(&record.data),
                };
                writer
                    .write_packet(&packet)
                    .map_err(|source| CaptureError::Pcap {
                        path: PathBuf::new(),
                        source,
                    })?;
            }
            WriterInner::PcapNg(writer, interfaces) => {
                let interface_id = match interfaces.ids_by_link_type.get(&record.link_type.0) {
                    Some(id) => *id,
                    None => {
                        let id = interfaces.ids_by_link_type.len() as u32;
                        let idb = InterfaceDescriptionBlock {
                            linktype: DataLink::from(record.link_type.0),
                            snaplen: 0,
                            options: Vec::new(),
                        };
                        writer
                            .write_block(&Block::InterfaceDescription(idb))
                            .map_err(|source| CaptureError::PcapNg {
                                path: PathBuf::new(),
                                source,
                            })?;
                        interfaces.ids_by_link_type.insert(record.link_type.0, id);
                        id
                    }
                };

                let epb = EnhancedPacketBlock {
                    interface_id,
                    timestamp: record.timestamp,
                    original_len: record.original_len,
                    data: std::borrow::Cow::Borrowed(&record.data),
                    options: Vec::new(),
                };
                writer
                    .write_block(&Block::EnhancedPacket(epb))
                    .map_err(|source| CaptureError::PcapNg {
                        path: PathBuf::new(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Persist the temp file at `path`, falling back to a copy+remove
    /// when the rename would cross filesystems (EXDEV) — identical logic
    /// to the teacher's `Dumper::save_pcap`.
    pub fn persist(self, path: &Path) -> Result<(), CaptureError> {
        match self.tmp.persist(path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.raw_os_error() == Some(18) => {
                let temp_path = e.file.path().to_path_buf();
                std::fs::copy(&temp_path, path).map_err(|source| CaptureError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                std::fs::remove_file(&temp_path).map_err(|source| CaptureError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok(())
            }
            Err(e) => Err(CaptureError::Io {
                path: path.to_path_buf(),
                source: e.error,
            }),
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }
}
