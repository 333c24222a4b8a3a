//! Receives an RTP video stream on UDP port 5000 (RED payload type 100 carrying ULPFEC with
//! payload type 127), and logs the frames that come out of the jitter buffer.
//!
//!     RUST_LOG=debug cargo run --example recv

use rtp_video_jitter::*;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time;

const PACKET_SIZE_MAX: usize = 1500;
const RED_PAYLOAD_TYPE: u8 = 100;
const FEC_PAYLOAD_TYPE: u8 = 127;
const STATS_INTERVAL: time::Duration = time::Duration::from_secs(2);

fn create_source(port: u16) -> Result<UdpSocket, io::Error> {
    let s = Socket::new(Domain::ipv4(), Type::dgram(), Some(Protocol::udp()))?;
    s.set_recv_buffer_size(2 * 1024 * 1024)?;
    let addr = SocketAddr::new(
        "127.0.0.1"
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?,
        port,
    );
    s.bind(&addr.into())?;
    let sock = s.into_udp_socket();
    sock.set_read_timeout(Some(time::Duration::from_millis(100)))?;
    Ok(sock)
}

fn decode_loop(jb: Arc<JitterBuffer>) {
    let mut frames = 0u64;
    loop {
        match jb.get_complete_frame_for_decoding(time::Duration::from_millis(200)) {
            Ok(Some(frame)) => {
                frames += 1;
                log::info!(
                    "frame #{} ts={} {:?} {} packets, {} bytes{}",
                    frames,
                    frame.timestamp(),
                    frame.frame_type(),
                    frame.packets().len(),
                    frame.length(),
                    if frame.is_complete() { "" } else { " (incomplete)" }
                );
                jb.release_frame(frame.handle());
            }
            Ok(None) => (),
            Err(GetFrameError::NotRunning) => break,
            Err(e) => log::warn!("retrieval failed: {}", e),
        }
    }
}

fn dump_stats(receiver: &mut VideoReceiver<GenericPayloadParser>) {
    let jb = receiver.jitter_buffer().clone();
    let (missing, key_frame) = jb.get_nack_list();
    if !missing.is_empty() {
        println!("NACK {:?}", missing);
    }
    if key_frame || receiver.request_key_frame() {
        println!("key frame needed");
    }
    let (delta, key) = jb.frame_statistics();
    let (fps, bps) = jb.incoming_rate_statistics(time::Instant::now());
    let s = receiver.statistics();
    let f = receiver.fec_statistics();
    println!(
        "frames: key={} delta={} dropped={} fps={} bps={} jitter={}ms",
        key,
        delta,
        jb.drop_count(),
        fps,
        bps,
        jb.estimated_jitter_ms()
    );
    println!(
        "packets: malformed={} duplicate={} old={} recovered={} red={} fec={}",
        s.malformed, s.duplicate, s.old, s.recovered, f.red_packets, f.fec_packets
    );
}

fn main() -> Result<(), io::Error> {
    env_logger::init();

    let sock = create_source(5000)?;
    let jb = Arc::new(JitterBuffer::new(JitterBufferConfig::default()));
    jb.start();
    let decoder = {
        let jb = jb.clone();
        thread::spawn(move || decode_loop(jb))
    };

    let mut receiver = VideoReceiver::new(jb.clone(), GenericPayloadParser);
    receiver.set_red_payload_type(RED_PAYLOAD_TYPE);
    receiver.set_fec_payload_type(FEC_PAYLOAD_TYPE);

    let mut buf = vec![0; PACKET_SIZE_MAX];
    let mut last_stats = time::Instant::now();
    let result = loop {
        match sock.recv(&mut buf[..]) {
            Ok(size) => {
                if let Err(e) = receiver.on_rtp_packet(&buf[..size], time::Instant::now()) {
                    log::debug!("dropped packet: {}", e);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => break Err(e),
        }
        if last_stats.elapsed() >= STATS_INTERVAL {
            dump_stats(&mut receiver);
            last_stats = time::Instant::now();
        }
    };

    jb.stop();
    if decoder.join().is_err() {
        log::error!("decode thread panicked");
    }
    result
}
