use super::client::{LogClient, ReadStatus};
use super::shm::{frame_size, LogWriter};
use super::*;
use crate::time::Timespec;

fn shm_name(tag: &str) -> String {
    format!("blockrt-test-{}-{tag}.logshm", std::process::id())
}

fn rec(n: usize) -> LogRecord {
    LogRecord::format(
        Level::Info,
        Timespec { sec: n as i64, nsec: 0 },
        "test",
        format_args!("msg {n}"),
    )
}

#[test]
fn test_record_bounds() {
    let long_src = "s".repeat(SRC_MAXLEN + 20);
    let r = LogRecord::format(
        Level::Warn,
        Timespec::ZERO,
        &long_src,
        format_args!("{}", "m".repeat(MSG_MAXLEN + 20)),
    );
    assert_eq!(r.level(), Some(Level::Warn));
    assert_eq!(r.src().len(), SRC_MAXLEN);
    assert_eq!(r.msg().len(), MSG_MAXLEN);
}

#[test]
fn test_wrap_off_packing() {
    let pos = WrapOff { wrap: 3, off: 1120 };
    assert_eq!(WrapOff::unpack(pos.pack()), pos);
    // wrap lives in the low half of the packed word.
    assert_eq!(pos.pack() as u32, 3);
}

#[test]
fn test_write_read_in_order() {
    let name = shm_name("order");
    let writer = LogWriter::create(&name).unwrap();
    let mut client = LogClient::open(&name).unwrap();

    assert_eq!(client.status(), ReadStatus::NoData);

    for n in 0..3 {
        writer.write(&rec(n));
    }
    assert_eq!(client.status(), ReadStatus::NewData);

    for n in 0..3 {
        let (status, r) = client.read_frame();
        assert_eq!(status, ReadStatus::NewData);
        let r = r.unwrap();
        assert_eq!(r.msg(), format!("msg {n}"));
        assert_eq!(r.src(), "test");
        assert_eq!(r.ts().sec, n as i64);
    }
    assert_eq!(client.read_frame().0, ReadStatus::NoData);
}

#[test]
fn test_cursor_advances_by_frames() {
    let name = shm_name("cursor");
    let writer = LogWriter::create(&name).unwrap();
    let mut client = LogClient::open(&name).unwrap();

    for n in 0..5 {
        writer.write(&rec(n));
    }
    for k in 1..=5u32 {
        client.read_frame();
        assert_eq!(
            client.position(),
            WrapOff {
                wrap: 0,
                off: k * frame_size() as u32
            }
        );
    }
}

#[test]
fn test_wrap_at_exact_boundary() {
    let name = shm_name("wrap");
    let writer = LogWriter::create(&name).unwrap();

    for n in 0..LOG_BUFFER_DEPTH - 1 {
        writer.write(&rec(n));
    }
    assert_eq!(
        writer.position(),
        WrapOff {
            wrap: 0,
            off: ((LOG_BUFFER_DEPTH - 1) * frame_size()) as u32
        }
    );

    // The write that fills the last frame wraps the offset to zero and
    // increments the wrap counter exactly once.
    writer.write(&rec(LOG_BUFFER_DEPTH - 1));
    assert_eq!(writer.position(), WrapOff { wrap: 1, off: 0 });
}

#[test]
fn test_overrun_detected_and_reset() {
    let name = shm_name("overrun");
    let writer = LogWriter::create(&name).unwrap();
    let mut client = LogClient::open(&name).unwrap();

    for n in 0..LOG_BUFFER_DEPTH + 10 {
        writer.write(&rec(n));
    }
    assert_eq!(client.status(), ReadStatus::Overrun);
    assert_eq!(client.read_frame().0, ReadStatus::Overrun);

    client.reset();
    assert_eq!(client.status(), ReadStatus::NoData);
}

#[test]
fn test_seek_to_oldest_before_wrap() {
    let name = shm_name("seek");
    let writer = LogWriter::create(&name).unwrap();

    for n in 0..5 {
        writer.write(&rec(n));
    }

    let mut client = LogClient::open(&name).unwrap();
    // Opening skips the backlog...
    assert_eq!(client.status(), ReadStatus::NoData);

    // ...seeking to the oldest recovers it from offset zero.
    client.seek_to_oldest();
    assert_eq!(client.position(), WrapOff::ZERO);
    for n in 0..5 {
        let (_, r) = client.read_frame();
        assert_eq!(r.unwrap().msg(), format!("msg {n}"));
    }
}

#[test]
fn test_seek_to_oldest_keeps_crush_zone() {
    let name = shm_name("crush");
    let writer = LogWriter::create(&name).unwrap();

    for n in 0..LOG_BUFFER_DEPTH + 50 {
        writer.write(&rec(n));
    }

    let mut client = LogClient::open(&name).unwrap();
    client.seek_to_oldest();

    // The cursor sits exactly the crush zone ahead of the writer and
    // everything from there on is readable.
    assert_eq!(client.status(), ReadStatus::NewData);
    let (_, first) = client.read_frame();
    assert!(first.is_some());

    let mut cnt = 1;
    while client.read_frame().0 == ReadStatus::NewData {
        cnt += 1;
    }
    assert_eq!(cnt, LOG_BUFFER_DEPTH - SEEK_OLDEST_CRUSH_ZONE as usize);
}
