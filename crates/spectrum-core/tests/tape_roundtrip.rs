//! Tape round trip: play a TAP through the pulse-accurate player while
//! the recorder listens, and the re-decoded blocks must match the
//! original bytes exactly.

use spectrum_core::tape::recorder::TapeRecorder;
use spectrum_core::tape::tap::{self, TapFile};
use spectrum_core::tape::{TapePlayer, TapeSource, TapeTransition};

/// Build a two-block TAP: a 17-byte header block and a data block.
fn source_tap() -> Vec<u8> {
    let mut header_payload = vec![0u8; 17];
    header_payload[0] = 3; // CODE
    header_payload[1..5].copy_from_slice(b"test");

    let data_payload: Vec<u8> = (0u8..=63).collect();

    let mut raw = Vec::new();
    tap::append_block(&mut raw, &tap::build_block(0x00, &header_payload));
    tap::append_block(&mut raw, &tap::build_block(0xFF, &data_payload));
    raw
}

#[test]
fn tap_play_record_round_trip() {
    let original = source_tap();
    let parsed = TapFile::parse(&original).expect("source TAP is valid");
    let original_blocks: Vec<Vec<u8>> =
        parsed.blocks.iter().map(|b| b.bytes.clone()).collect();

    let mut player = TapePlayer::new();
    player.insert(TapeSource::Blocks(
        TapFile::parse(&original).expect("parse").into_tape_blocks(),
    ));
    player.play(0);

    let mut recorder = TapeRecorder::new();
    recorder.start_tap(None, false, 0);

    // Drive both subsystems on a shared timeline, the way the frame
    // loop does, until the tape runs out.
    let mut transitions: Vec<TapeTransition> = Vec::new();
    let mut now = 0u64;
    while !player.is_finished() && now < 100_000_000 {
        now += 10_000;
        transitions.clear();
        player.update(now, &mut transitions);
        for tr in &transitions {
            recorder.set_mic(tr.t_state, tr.level);
        }
        recorder.update(now);
    }
    assert!(player.is_finished(), "tape must play out");

    // Let the trailing silence finalise the last block and the session.
    recorder.update(now + 8_000_000);
    assert!(!recorder.is_recording(), "auto-stop closed the session");

    let recorded = TapFile::parse(recorder.tap_data()).expect("recorded stream is valid TAP");
    let recorded_blocks: Vec<Vec<u8>> =
        recorded.blocks.iter().map(|b| b.bytes.clone()).collect();

    assert_eq!(
        recorded_blocks, original_blocks,
        "re-decoded block bytes equal the originals"
    );
}

#[test]
fn wav_tape_plays_back_as_ear_transitions() {
    // Render a 1 kHz square wave into WAV bytes, import it, and the
    // player must reproduce the edges on its own timeline.
    let rate = 44_100u32;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
        for i in 0..4410 {
            // ~22 samples per half period.
            let level = if (i / 22) % 2 == 0 { 18_000i16 } else { -18_000 };
            writer.write_sample(level).expect("sample");
        }
        writer.finalize().expect("finalize");
    }

    let source = spectrum_core::tape::wav::import_bytes(&cursor.into_inner()).expect("import");
    let mut player = TapePlayer::new();
    player.insert(source);
    player.play(0);

    let mut transitions: Vec<TapeTransition> = Vec::new();
    player.update(20_000_000, &mut transitions);

    assert!(
        transitions.len() > 150,
        "expected ~200 edges, got {}",
        transitions.len()
    );
    // Edge spacing ≈ 22 samples × (3.5 MHz / 44.1 kHz) ≈ 1746 T.
    let mut spacings: Vec<u64> = transitions
        .windows(2)
        .map(|w| w[1].t_state - w[0].t_state)
        .collect();
    spacings.pop(); // final flip may close a partial run
    assert!(
        spacings.iter().all(|&d| (1600..1900).contains(&d)),
        "edge spacing tracks the sample clock"
    );
}

#[test]
fn wav_recording_of_played_tape_contains_signal() {
    let original = source_tap();
    let mut player = TapePlayer::new();
    player.insert(TapeSource::Blocks(
        TapFile::parse(&original).expect("parse").into_tape_blocks(),
    ));
    player.play(0);

    let mut recorder = TapeRecorder::new();
    recorder
        .start_wav(None, false, 44_100, 0, 0)
        .expect("start");

    let mut transitions: Vec<TapeTransition> = Vec::new();
    let mut now = 0u64;
    while !player.is_finished() && now < 100_000_000 {
        now += 10_000;
        transitions.clear();
        player.update(now, &mut transitions);
        for tr in &transitions {
            recorder.set_mic(tr.t_state, tr.level);
        }
        recorder.update(now);
    }
    recorder.update(now + 8_000_000);

    let samples = recorder.audio_samples();
    assert!(!samples.is_empty());
    let highs = samples.iter().filter(|&&s| s > 0).count();
    let lows = samples.iter().filter(|&&s| s < 0).count();
    assert!(highs > 1000 && lows > 1000, "both polarities present");
}
