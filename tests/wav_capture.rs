//! Audio captured through a source → sink pipeline survives bit-exact.

mod common;

use common::{registry, Probe};
use std::io::Cursor;
use std::sync::Arc;
use xfcore::harness::HostHarness;
use xfcore::{DspConfig, Opcode};

const SAMPLE_RATE: u32 = 48_000;

fn tone(frames: usize) -> Vec<i16> {
    (0..frames)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 12_000.0) as i16
        })
        .collect()
}

fn to_wav(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn from_wav(bytes: &[u8]) -> Vec<i16> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
    assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
    reader.samples::<i16>().map(|s| s.unwrap()).collect()
}

#[test]
fn tone_through_pipeline_is_bit_exact() {
    let probe = Probe::new();
    let config = DspConfig::default().with_cores(2);
    let mut h = HostHarness::new(config, Arc::new(registry(&probe))).unwrap();
    let src = h.register(0, "source").unwrap();
    let sink = h.register(1, "sink").unwrap();
    h.route(src, sink, 3, 96, 4).unwrap();

    let samples = tone(1000);
    let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let mut addrs = Vec::new();
    for chunk in pcm.chunks(256) {
        let addr = h.alloc(0, chunk.len() as u32).unwrap();
        h.host().memory().write(addr, chunk).unwrap();
        addrs.push((addr, chunk.len() as u32));
    }
    for &(addr, len) in &addrs {
        h.send(src, Opcode::FILL_THIS_BUFFER, len, addr).unwrap();
    }
    h.send(src, Opcode::FILL_THIS_BUFFER, 0, 0).unwrap();
    let responses = h.drain().unwrap();
    assert_eq!(responses.len(), addrs.len() + 1);
    assert!(responses.iter().all(|r| !r.is_failure()));

    let captured: Vec<u8> = probe.deliveries().concat();
    assert_eq!(captured.len(), pcm.len());
    assert!(probe.deliveries().iter().all(|d| d.len() <= 96));
    let captured: Vec<i16> = captured
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    let wav = to_wav(&captured);
    assert_eq!(from_wav(&wav), samples);
    assert_eq!(*probe.eos.lock().unwrap(), 1);

    for (addr, len) in addrs {
        h.free(0, addr, len).unwrap();
    }
}
