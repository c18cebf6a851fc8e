//! End-to-end rapid-block scenarios against the simulated device.

use daq_digitizer::{
    DigitizerBlock, SimulatedDriver, Tag, WorkOutput, WorkReturn,
};
use std::time::{Duration, Instant};

/// Block in rapid-block mode: 3 captures of 100 pre + 900 post samples,
/// channel A and port0 enabled, one shot.
fn rapid_block() -> DigitizerBlock {
    let driver = SimulatedDriver::builder().amplitude(2.0).build();
    let mut block = DigitizerBlock::new(2, 1, Box::new(driver)).unwrap();
    block.set_samp_rate(1_000_000.0).unwrap();
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_diport("port0", true, 1.5).unwrap();
    block.set_samples(900, 100).unwrap();
    block.set_rapid_block(3).unwrap();
    block.set_trigger_once(true);
    block
}

/// Drain the block until end of stream, collecting everything.
fn run_to_completion(block: &mut DigitizerBlock, capacity: usize) -> (WorkOutput, usize) {
    let mut out = WorkOutput::new(2, 1);
    let mut total = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "rapid block run did not finish");
        match block.work(capacity, &mut out).unwrap() {
            WorkReturn::Produced(n) => total += n,
            WorkReturn::Again => continue,
            WorkReturn::Done => break,
        }
    }
    (out, total)
}

#[test]
fn test_three_captures_then_end_of_stream() {
    let mut block = rapid_block();
    assert!(block.start());
    block.arm().unwrap();

    let (out, total) = run_to_completion(&mut block, 4096);

    // 3 waveforms of 1000 effective samples on each enabled stream
    assert_eq!(total, 3_000);
    assert_eq!(out.analog[0].samples.len(), 3_000);
    assert_eq!(out.analog[0].errors.len(), 3_000);
    assert_eq!(out.ports[0].samples.len(), 3_000);
    assert!(out.analog[1].samples.is_empty());

    // exactly one trigger_info per waveform on the value stream, at the
    // start of each waveform
    let info_offsets: Vec<u64> = out
        .tags
        .iter()
        .filter(|t| t.stream == 0 && matches!(t.tag, Tag::TriggerInfo(_)))
        .map(|t| t.offset)
        .collect();
    assert_eq!(info_offsets, vec![0, 1_000, 2_000]);

    // the bare trigger marker sits at the pre-trigger boundary of each
    // waveform
    let trigger_offsets: Vec<u64> = out
        .tags
        .iter()
        .filter(|t| t.stream == 0 && matches!(t.tag, Tag::Trigger))
        .map(|t| t.offset)
        .collect();
    assert_eq!(trigger_offsets, vec![100, 1_100, 2_100]);

    // ports carry the same annotations with a clean status
    let port_stream = out.port_stream(0);
    let port_infos: Vec<&Tag> = out
        .tags
        .iter()
        .filter(|t| t.stream == port_stream && matches!(t.tag, Tag::TriggerInfo(_)))
        .map(|t| &t.tag)
        .collect();
    assert_eq!(port_infos.len(), 3);
    for tag in port_infos {
        let Tag::TriggerInfo(info) = tag else { unreachable!() };
        assert_eq!(info.status, 0);
        assert_eq!(info.pre_trigger_samples, 100);
        assert_eq!(info.post_trigger_samples, 900);
    }

    // timebase_info exactly once, on every stream
    let timebase_tags = out
        .tags
        .iter()
        .filter(|t| matches!(t.tag, Tag::TimebaseInfo { .. }))
        .count();
    assert_eq!(timebase_tags, out.stream_count());

    // waveform content: flat pre-trigger, signal after the boundary
    assert!(out.analog[0].samples[..100].iter().all(|&v| v == 0.0));
    assert!(out.analog[0].samples[100] > 0.0);
    assert_eq!(out.ports[0].samples[99], 0x00);
    assert_eq!(out.ports[0].samples[100], 0xFF);

    assert!(block.stop());
}

#[test]
fn test_small_capacity_splits_reads_without_duplicating_tags() {
    // a capacity far below the waveform size forces the two-phase reader
    // through many ReadingRest rounds; totals and tags must not change
    let mut block = rapid_block();
    assert!(block.start());
    block.arm().unwrap();

    let (out, total) = run_to_completion(&mut block, 256);

    assert_eq!(total, 3_000);
    assert_eq!(out.analog[0].samples.len(), 3_000);

    let info_offsets: Vec<u64> = out
        .tags
        .iter()
        .filter(|t| t.stream == 0 && matches!(t.tag, Tag::TriggerInfo(_)))
        .map(|t| t.offset)
        .collect();
    assert_eq!(info_offsets, vec![0, 1_000, 2_000]);

    let trigger_offsets: Vec<u64> = out
        .tags
        .iter()
        .filter(|t| t.stream == 0 && matches!(t.tag, Tag::Trigger))
        .map(|t| t.offset)
        .collect();
    assert_eq!(trigger_offsets, vec![100, 1_100, 2_100]);

    assert!(block.stop());
}

#[test]
fn test_auto_arm_one_shot() {
    let mut block = rapid_block();
    block.set_auto_arm(true);
    assert!(block.start());
    // no manual arm: the work loop arms the device itself

    let (out, total) = run_to_completion(&mut block, 4096);
    assert_eq!(total, 3_000);
    assert_eq!(out.analog[0].samples.len(), 3_000);
    assert!(block.stop());
}

#[test]
fn test_downsampling_scales_waveform_and_trigger_offsets() -> anyhow::Result<()> {
    use daq_digitizer::DownsamplingMode;

    let driver = SimulatedDriver::builder().build();
    let mut block = DigitizerBlock::new(1, 0, Box::new(driver))?;
    block.set_samp_rate(1_000_000.0)?;
    block.set_aichan("A", true, 5.0, true, 0.0)?;
    block.set_samples(900, 100)?;
    block.set_downsampling(DownsamplingMode::Decimate, 4)?;
    block.set_rapid_block(2)?;
    block.set_trigger_once(true);
    assert!(block.start());
    block.arm()?;

    let mut out = WorkOutput::new(1, 0);
    let mut total = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline);
        match block.work(4096, &mut out)? {
            WorkReturn::Produced(n) => total += n,
            WorkReturn::Again => continue,
            WorkReturn::Done => break,
        }
    }

    // 1000 raw samples decimated by 4: 250 effective per waveform
    assert_eq!(total, 500);
    let trigger_offsets: Vec<u64> = out
        .tags
        .iter()
        .filter(|t| t.stream == 0 && matches!(t.tag, Tag::Trigger))
        .map(|t| t.offset)
        .collect();
    assert_eq!(trigger_offsets, vec![25, 275]);

    // timebase reflects the downsampling factor
    let timebase = out.tags.iter().find_map(|t| match t.tag {
        Tag::TimebaseInfo { timebase } => Some(timebase),
        _ => None,
    });
    assert_eq!(timebase, Some(4.0 / 1_000_000.0));

    assert!(block.stop());
    Ok(())
}

#[test]
fn test_stop_unblocks_rapid_block_wait() {
    // without auto-arm and without an armed device no captures ever
    // complete; a stop request must still unblock the worker
    let mut block = rapid_block();
    assert!(block.start());

    let stop = block.stop_handle();
    let worker = std::thread::spawn(move || {
        let mut out = WorkOutput::new(2, 1);
        let result = block.work(4096, &mut out).unwrap();
        assert!(block.stop());
        result
    });

    std::thread::sleep(Duration::from_millis(50));
    stop.request_stop();

    assert_eq!(worker.join().unwrap(), WorkReturn::Done);
}
