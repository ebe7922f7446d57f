//! Round-trips small synthetic capture files through the full pipeline.
//!
//! Packets are synthesized with `etherparse::PacketBuilder`, the same
//! crate and technique as the teacher's `Dumper::write_tcp_packet`
//! (`examples/SimoneErrigo-mini-proxad/src/proxy/dumper.rs`).

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etherparse::PacketBuilder;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use pktmask::anonymize::IpMap;
use pktmask::config::PipelineConfig;
use pktmask::events::{PipelineEvent, ProgressCallback};
use pktmask::executor::{CancellationToken, PipelineExecutor};
use pktmask::stage::build_stages;

const CLIENT_MAC: [u8; 6] = [0x11; 6];
const SERVER_MAC: [u8; 6] = [0x22; 6];

fn build_tcp_packet(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv4(src_ip.octets(), dst_ip.octets(), 64)
        .tcp(src_port, dst_port, seq, 65535)
        .ack(ack);
    let mut buffer = Vec::new();
    builder.write(&mut buffer, payload).unwrap();
    buffer
}

/// A minimal TLS record: content type, legacy version, length, body.
fn tls_record(content_type: u8, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(5 + body.len());
    record.push(content_type);
    record.extend_from_slice(&[0x03, 0x03]);
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(body);
    record
}

fn write_pcap(path: &std::path::Path, packets: &[(Duration, Vec<u8>)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = PcapWriter::with_header(file, PcapHeader::default()).unwrap();
    for (timestamp, data) in packets {
        let packet = PcapPacket {
            timestamp: *timestamp,
            orig_len: data.len() as u32,
            data: std::borrow::Cow::Borrowed(data),
        };
        writer.write_packet(&packet).unwrap();
    }
}

fn no_op_progress() -> ProgressCallback {
    Box::new(|_event: PipelineEvent| {})
}

#[test]
fn dedup_anonymize_and_mask_round_trip_a_synthetic_capture() {
    let client = Ipv4Addr::new(203, 0, 113, 10);
    let server = Ipv4Addr::new(198, 51, 100, 20);

    let handshake_record = tls_record(0x16, b"client-hello-bytes");
    let app_data_record = tls_record(0x17, b"super-secret-application-payload");

    let packet_a = build_tcp_packet(client, server, 443, 51000, 1, 1, &handshake_record);
    let packet_b = build_tcp_packet(
        server,
        client,
        51000,
        443,
        1,
        1 + handshake_record.len() as u32,
        &app_data_record,
    );
    // Exact duplicate of packet_a: the dedup stage should drop this one.
    let packet_a_dup = packet_a.clone();

    let input_dir = tempfile::tempdir().unwrap();
    let input_path = input_dir.path().join("trace.pcap");
    write_pcap(
        &input_path,
        &[
            (Duration::from_secs(1), packet_a),
            (Duration::from_secs(2), packet_a_dup),
            (Duration::from_secs(3), packet_b),
        ],
    );

    let mut config = PipelineConfig::default();
    config.dedup.enabled = true;
    config.anonymize.enabled = true;
    config.mask.enabled = true;
    config.mask.tls.preserve_application_data = false;

    let ip_map = Arc::new(Mutex::new(IpMap::new()));
    let stages = build_stages(&config, ip_map);
    let mut executor = PipelineExecutor::new(stages);

    let output = NamedTempFile::new().unwrap();
    let progress = no_op_progress();
    let cancel = CancellationToken::new();
    let result = executor.run(&input_path, output.path(), &progress, &cancel);

    assert!(result.ok, "pipeline failed: {:?}", result.errors);
    assert_eq!(result.stages.len(), 3);

    let dedup_stats = &result.stages[0];
    assert_eq!(dedup_stats.stage_name, "dedup");
    assert_eq!(dedup_stats.packets_processed, 3);
    assert_eq!(dedup_stats.packets_modified, 1, "one exact duplicate should be dropped");

    let mut reader = pktmask::capture::CaptureReader::open(output.path()).unwrap();
    let mut packets = Vec::new();
    while let Some(record) = reader.next_packet() {
        packets.push(record.unwrap());
    }
    assert_eq!(packets.len(), 2, "duplicate packet should not appear in output");

    // IP addresses must no longer be the originals anywhere in the output.
    for record in &packets {
        assert!(!contains_ipv4(&record.data, client));
        assert!(!contains_ipv4(&record.data, server));
    }
}

#[test]
fn disabled_stages_copy_the_file_through_unchanged() {
    let config = {
        let mut config = PipelineConfig::default();
        config.dedup.enabled = false;
        config.anonymize.enabled = false;
        config.mask.enabled = false;
        config
    };

    let input_dir = tempfile::tempdir().unwrap();
    let input_path = input_dir.path().join("trace.pcap");
    let payload = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        1234,
        80,
        1,
        1,
        b"hello",
    );
    write_pcap(&input_path, &[(Duration::from_secs(1), payload)]);

    let ip_map = Arc::new(Mutex::new(IpMap::new()));
    let stages = build_stages(&config, ip_map);
    assert!(stages.is_empty());
    let mut executor = PipelineExecutor::new(stages);

    let output = NamedTempFile::new().unwrap();
    let progress = no_op_progress();
    let cancel = CancellationToken::new();
    let result = executor.run(&input_path, output.path(), &progress, &cancel);

    assert!(result.ok);
    let input_bytes = std::fs::read(&input_path).unwrap();
    let output_bytes = std::fs::read(output.path()).unwrap();
    assert_eq!(input_bytes, output_bytes);
}

fn contains_ipv4(data: &[u8], addr: Ipv4Addr) -> bool {
    let needle = addr.octets();
    data.windows(4).any(|window| window == needle)
}
