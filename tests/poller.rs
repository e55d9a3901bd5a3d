mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use common::{CONTROL_REGISTER, Event, ScriptedDevice, SharedLog, wait_until};
use nut4nt_dumper::{
    flag::{RunFlag, StopCause},
    poller::{PollerConfig, PollerFault, RegisterPoller},
    regdump::RegisterLogEntry,
};

fn config() -> PollerConfig {
    PollerConfig {
        busy_interval: Duration::from_micros(50),
        ..PollerConfig::default()
    }
}

fn entries(log: &SharedLog) -> Vec<RegisterLogEntry> {
    log.text().lines().map(|line| line.parse().unwrap()).collect()
}

#[test]
fn sentinel_on_channel_two_stops_before_channel_three() {
    let device = ScriptedDevice::new().registers(|channel, address| match (channel, address) {
        (2, CONTROL_REGISTER) => 0xff,
        (channel, CONTROL_REGISTER) => channel << 4,
        (_, address) => address,
    });
    let probe = device.probe();
    let flag = Arc::new(RunFlag::new());
    let log = SharedLog::default();

    let report = RegisterPoller::new(Arc::new(device), flag.clone(), config(), log.clone(), Instant::now()).run();

    assert!(!flag.is_running());
    assert!(matches!(
        flag.take_cause(),
        Some(StopCause::Poller(PollerFault::Sentinel { channel: 2, register: CONTROL_REGISTER }))
    ));
    let selects: Vec<u8> = probe
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Write(CONTROL_REGISTER, value) => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(selects, vec![0x01, 0x11, 0x21]);
    // Nothing was read after the sentinel.
    assert_eq!(probe.events().last(), Some(&Event::Read(CONTROL_REGISTER)));

    let logged = entries(&log);
    assert_eq!(logged.len(), 2);
    assert_eq!(report.entries, 2);
    assert_eq!(report.sweeps, 0);
    assert_eq!(logged[0].values, [0x00, 0x06, 0x07, 0x08, 0x09, 0x0a]);
    assert_eq!(logged[1].values[0], 0x10);
}

#[test]
fn waits_for_busy_bit_then_reads_status_registers() {
    let reads = Arc::new(AtomicUsize::new(0));
    let counter = reads.clone();
    let device = ScriptedDevice::new().registers(move |channel, address| {
        if address != CONTROL_REGISTER {
            return 0x40 + address;
        }
        // Busy for the first three polls of every channel.
        if counter.fetch_add(1, Ordering::SeqCst) % 4 < 3 {
            (channel << 4) | 0x01
        } else {
            channel << 4
        }
    });
    let probe = device.probe();
    let flag = Arc::new(RunFlag::new());
    let log = SharedLog::default();
    let stopper = flag.clone();
    let watched = log.clone();

    let handle = RegisterPoller::new(Arc::new(device), flag.clone(), config(), log.clone(), Instant::now())
        .spawn()
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || watched.text().lines().count() >= 8));
    stopper.stop();
    let report = handle.join().unwrap();

    assert!(report.sweeps >= 2);
    let logged = entries(&log);
    for (i, entry) in logged.iter().take(8).enumerate() {
        assert_eq!(entry.values[0], (i as u8 % 4) << 4);
        assert_eq!(&entry.values[1..], &[0x46, 0x47, 0x48, 0x49, 0x4a]);
    }
    assert!(logged.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));

    // Four control reads per logged channel: three busy, one clear.
    let events = probe.events();
    let first_status = events.iter().position(|e| *e == Event::Read(0x06)).unwrap();
    let busy_reads = events[..first_status]
        .iter()
        .filter(|e| **e == Event::Read(CONTROL_REGISTER))
        .count();
    assert_eq!(busy_reads, 4);
}

#[test]
fn stuck_busy_bit_still_honours_the_flag() {
    let device = ScriptedDevice::new().registers(|channel, _| (channel << 4) | 0x01);
    let flag = Arc::new(RunFlag::new());
    let log = SharedLog::default();

    let handle = RegisterPoller::new(Arc::new(device), flag.clone(), config(), log.clone(), Instant::now())
        .spawn()
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let stopped = Instant::now();
    flag.stop();

    assert!(wait_until(Duration::from_secs(1), || handle.is_finished()));
    assert!(stopped.elapsed() < Duration::from_secs(1));
    let report = handle.join().unwrap();
    assert_eq!(report.entries, 0);
    assert!(log.text().is_empty());
    assert!(flag.take_cause().is_none());
}

#[test]
fn stopped_flag_means_no_register_traffic() {
    let device = ScriptedDevice::new();
    let probe = device.probe();
    let flag = Arc::new(RunFlag::new());
    flag.stop();

    let report = RegisterPoller::new(Arc::new(device), flag, config(), SharedLog::default(), Instant::now()).run();

    assert_eq!(report.entries, 0);
    assert!(probe.events().is_empty());
}
