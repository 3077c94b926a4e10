use crate::block::{connect_uni, PortSpec};
use crate::error::Error;
use crate::testutil::{cyclic_block, io_block, latch_block, node_with_std};

#[test]
fn test_init_requires_configs() {
    let node = node_with_std("t-cyc-cfg");
    let b = node.block_create("cyclic", "fifo").unwrap();

    // type_name and buffer_len carry min-length bounds.
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));

    b.config_set_str("type_name", "uint32").unwrap();
    b.config_set_scalar::<u32>("buffer_len", 0).unwrap();
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));

    b.config_set_scalar::<u32>("buffer_len", 4).unwrap();
    b.init().unwrap();

    let b2 = node.block_create("cyclic", "fifo2").unwrap();
    b2.config_set_str("type_name", "nosuchtype").unwrap();
    b2.config_set_scalar::<u32>("buffer_len", 4).unwrap();
    assert!(matches!(b2.init(), Err(Error::InvalidConfig(_))));
}

/// Source port, sink port and a fifo between them.
fn wired(
    name_prefix: &str,
    type_name: &str,
    data_len: u32,
    buffer_len: u32,
) -> (
    std::sync::Arc<crate::node::Node>,
    std::sync::Arc<crate::block::Port>,
    std::sync::Arc<crate::block::Port>,
    std::sync::Arc<crate::block::Block>,
) {
    let node = node_with_std(name_prefix);
    let src = io_block(
        &node,
        "src",
        vec![PortSpec::new("out")
            .output(type_name)
            .out_data_len(data_len as usize)],
    );
    let dst = io_block(
        &node,
        "dst",
        vec![PortSpec::new("in")
            .input(type_name)
            .in_data_len(data_len as usize)],
    );
    let fifo = cyclic_block(&node, "fifo", type_name, data_len, buffer_len);

    let out = src.port("out").unwrap();
    let inp = dst.port("in").unwrap();
    connect_uni(&out, &inp, &fifo).unwrap();
    (node, out, inp, fifo)
}

#[test]
fn test_lossless_ring() {
    let (node, out, inp, fifo) = wired("t-cyc-lossless", "uint32", 1, 4);

    // Watch the overruns port; it must never fire here.
    let (latch, overruns) = latch_block(&node, "ovr");
    fifo.port("overruns").unwrap().connect_out(&latch).unwrap();

    for v in [1u32, 2, 3] {
        out.write(&node.new_value::<u32>(&[v]).unwrap()).unwrap();
    }

    let mut buf = node.new_value::<u32>(&[0]).unwrap();
    for expect in [1u32, 2, 3] {
        assert_eq!(inp.read(&mut buf).unwrap(), 1);
        assert_eq!(buf.scalar::<u32>().unwrap(), expect);
    }
    assert_eq!(inp.read(&mut buf).unwrap(), 0);

    assert_eq!(overruns.write_count(), 0);
    assert_eq!(inp.read_count(), 3);
    assert_eq!(fifo.read_count(), 3);
    assert_eq!(fifo.write_count(), 3);
}

#[test]
fn test_overrun_drops_new_and_counts_once() {
    let (node, out, inp, fifo) = wired("t-cyc-overrun", "uint32", 1, 4);
    let (latch, overruns) = latch_block(&node, "ovr");
    fifo.port("overruns").unwrap().connect_out(&latch).unwrap();

    for v in [1u32, 2, 3, 4, 5] {
        out.write(&node.new_value::<u32>(&[v]).unwrap()).unwrap();
    }

    // Exactly one overrun update, carrying counter value 1.
    assert_eq!(overruns.write_count(), 1);
    assert_eq!(overruns.last_scalar::<u64>(), Some(1));

    // DropNew: the first four samples survive intact, the fifth is
    // gone.
    let mut buf = node.new_value::<u32>(&[0]).unwrap();
    for expect in [1u32, 2, 3, 4] {
        assert_eq!(inp.read(&mut buf).unwrap(), 1);
        assert_eq!(buf.scalar::<u32>().unwrap(), expect);
    }
    assert_eq!(inp.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_fifo_order_without_overrun() {
    let (node, out, inp, _fifo) = wired("t-cyc-order", "uint64", 1, 16);

    let values: Vec<u64> = (100..110).collect();
    for v in &values {
        out.write(&node.new_value::<u64>(&[*v]).unwrap()).unwrap();
    }

    let mut buf = node.new_value::<u64>(&[0]).unwrap();
    for expect in &values {
        assert_eq!(inp.read(&mut buf).unwrap(), 1);
        assert_eq!(buf.scalar::<u64>().unwrap(), *expect);
    }
}

#[test]
fn test_roundtrip_is_byte_equal() {
    let (node, out, inp, _fifo) = wired("t-cyc-bytes", "double", 1, 2);

    let v = node.new_value::<f64>(&[0.1234567890123]).unwrap();
    out.write(&v).unwrap();
    let mut buf = node.new_value::<f64>(&[0.0]).unwrap();
    assert_eq!(inp.read(&mut buf).unwrap(), 1);
    assert_eq!(buf.bytes(), v.bytes());
}

#[test]
fn test_array_payloads_and_len_check() {
    let (node, out, inp, _fifo) = wired("t-cyc-arr", "char", 1024, 4);

    let msg = node.new_value::<u8>(b"hello realtime world").unwrap();
    out.write(&msg).unwrap();

    let mut buf = node.new_value::<u8>(&[0; 1024]).unwrap();
    let n = inp.read(&mut buf).unwrap();
    assert_eq!(n, msg.len());
    assert_eq!(&buf.bytes()[..n], msg.bytes());

    // Oversized samples are refused outright; no partial write.
    let big = node.new_value::<u8>(&[7u8; 2048]).unwrap();
    out.write(&big).unwrap();
    assert_eq!(inp.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_single_byte_slots_behave_like_large_ones() {
    let (node, out, inp, _fifo) = wired("t-cyc-small", "char", 1, 4);

    for v in [10u8, 20, 30] {
        out.write(&node.new_value::<u8>(&[v]).unwrap()).unwrap();
    }
    let mut buf = node.new_value::<u8>(&[0]).unwrap();
    for expect in [10u8, 20, 30] {
        assert_eq!(inp.read(&mut buf).unwrap(), 1);
        assert_eq!(buf.scalar::<u8>().unwrap(), expect);
    }
    assert_eq!(inp.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_type_mismatch_is_a_noop() {
    let (node, out, inp, fifo) = wired("t-cyc-type", "uint32", 1, 4);

    // Push one valid sample so a successful read would be possible.
    out.write(&node.new_value::<u32>(&[42]).unwrap()).unwrap();

    // A mis-typed read aborts before touching the ring.
    let mut wrong = node.new_value::<f64>(&[0.0]).unwrap();
    assert!(matches!(
        inp.read(&mut wrong),
        Err(Error::TypeMismatch { .. })
    ));
    assert_eq!(inp.read_count(), 0);
    assert_eq!(fifo.read_count(), 0);

    let mut buf = node.new_value::<u32>(&[0]).unwrap();
    assert_eq!(inp.read(&mut buf).unwrap(), 1);
    assert_eq!(buf.scalar::<u32>().unwrap(), 42);
}

#[test]
fn test_write_fans_out_to_all_active_bindings() {
    let node = node_with_std("t-cyc-fanout");
    let src = io_block(
        &node,
        "src",
        vec![PortSpec::new("out").output("uint32")],
    );
    let fifo1 = cyclic_block(&node, "fifo1", "uint32", 1, 4);
    let fifo2 = cyclic_block(&node, "fifo2", "uint32", 1, 4);

    let out = src.port("out").unwrap();
    out.connect_out(&fifo1).unwrap();
    out.connect_out(&fifo2).unwrap();

    out.write(&node.new_value::<u32>(&[9]).unwrap()).unwrap();
    assert_eq!(fifo1.write_count(), 1);
    assert_eq!(fifo2.write_count(), 1);

    let dst = io_block(&node, "dst", vec![PortSpec::new("in").input("uint32")]);
    let inp = dst.port("in").unwrap();
    inp.connect_in(&fifo1).unwrap();
    inp.connect_in(&fifo2).unwrap();

    // The same sample arrives once per interaction.
    let mut buf = node.new_value::<u32>(&[0]).unwrap();
    assert_eq!(inp.read(&mut buf).unwrap(), 1);
    assert_eq!(buf.scalar::<u32>().unwrap(), 9);
    assert_eq!(inp.read(&mut buf).unwrap(), 1);
    assert_eq!(buf.scalar::<u32>().unwrap(), 9);
    assert_eq!(inp.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_read_polls_bindings_in_insertion_order() {
    let node = node_with_std("t-cyc-firstwins");
    let src1 = io_block(
        &node,
        "src1",
        vec![PortSpec::new("out").output("uint32")],
    );
    let src2 = io_block(
        &node,
        "src2",
        vec![PortSpec::new("out").output("uint32")],
    );
    let fifo1 = cyclic_block(&node, "fifo1", "uint32", 1, 4);
    let fifo2 = cyclic_block(&node, "fifo2", "uint32", 1, 4);
    src1.port("out").unwrap().connect_out(&fifo1).unwrap();
    src2.port("out").unwrap().connect_out(&fifo2).unwrap();

    let dst = io_block(&node, "dst", vec![PortSpec::new("in").input("uint32")]);
    let inp = dst.port("in").unwrap();
    inp.connect_in(&fifo1).unwrap();
    inp.connect_in(&fifo2).unwrap();

    src1.port("out").unwrap().write(&node.new_value::<u32>(&[1]).unwrap()).unwrap();
    src2.port("out").unwrap().write(&node.new_value::<u32>(&[2]).unwrap()).unwrap();

    // First data wins in binding order: fifo1 drains before fifo2 is
    // even considered.
    let mut buf = node.new_value::<u32>(&[0]).unwrap();
    assert_eq!(inp.read(&mut buf).unwrap(), 1);
    assert_eq!(buf.scalar::<u32>().unwrap(), 1);
    assert_eq!(inp.read(&mut buf).unwrap(), 1);
    assert_eq!(buf.scalar::<u32>().unwrap(), 2);
}

#[test]
fn test_concurrent_producer_consumer() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let (node, out, inp, _fifo) = wired("t-cyc-spsc", "uint64", 1, 64);

    const COUNT: u64 = 20_000;
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let node = Arc::clone(&node);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut val = node.new_value::<u64>(&[0]).unwrap();
            let mut next = 0u64;
            while next < COUNT {
                val.set_scalar(next).unwrap();
                out.write(&val).unwrap();
                next += 1;
                std::hint::spin_loop();
            }
            done.store(true, Ordering::Release);
        })
    };

    // The ring may overrun (the producer is faster), but everything
    // that arrives must arrive in order.
    let mut buf = node.new_value::<u64>(&[0]).unwrap();
    let mut last: Option<u64> = None;
    let mut received = 0u64;
    let mut drained = false;
    loop {
        if inp.read(&mut buf).unwrap() > 0 {
            let v = buf.scalar::<u64>().unwrap();
            if let Some(prev) = last {
                assert!(v > prev, "out of order: {v} after {prev}");
            }
            last = Some(v);
            received += 1;
            continue;
        }
        if drained {
            break;
        }
        // Keep polling until the producer is done, then one last drain.
        drained = done.load(Ordering::Acquire);
    }

    producer.join().unwrap();
    assert!(received > 0);
    assert!(received <= COUNT);
}
