use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prodlink::dispatch::Dispatcher;
use prodlink::recv::{DefaultHooks, ReceiverConfig};
use prodlink::wire::{self, AckCode};
use prodlink::{control, now_epoch};

/// Drive a whole receiver: dispatcher, worker thread, wire protocol, then a
/// flagged shutdown that drains the pool.
#[test]
fn dispatcher_serves_a_connection_and_drains_on_shutdown() {
    let _ = tracing_subscriber::fmt::try_init();

    let work = tempfile::tempdir().unwrap();
    let outdir = work.path().join("out");
    fs::create_dir_all(&outdir).unwrap();

    let cfg = ReceiverConfig {
        port: 0,
        max_worker: 2,
        timeout: Duration::from_secs(5),
        outdir: outdir.clone(),
        toggle_perms: true,
        ..ReceiverConfig::default()
    };
    let mut dispatcher = Dispatcher::new(cfg, Arc::new(DefaultHooks), None);
    let port = dispatcher.bind().unwrap();

    let runner = thread::spawn(move || {
        let result = dispatcher.run();
        (result, dispatcher.saw_error())
    });

    // Speak the wire protocol directly: one 64-byte product, seqno 0.
    let payload = vec![0xA5u8; 64];
    let header = wire::format_header(0, payload.len() as u64, now_epoch()).unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(&header).unwrap();
    client.write_all(&payload).unwrap();

    let mut ack = [0u8; wire::ACK_LEN];
    client.read_exact(&mut ack).unwrap();
    let ack = wire::parse_ack(&ack).unwrap();
    assert_eq!(ack.seqno, 0);
    assert_eq!(ack.code, AckCode::Ok);
    drop(client);

    let out_file = outdir.join(format!("{}-000000", std::process::id()));
    assert_eq!(fs::read(&out_file).unwrap(), payload);

    // First shutdown step: flag it, then poke the accept loop awake.
    control::set(control::SHUTDOWN);
    let _ = TcpStream::connect(("127.0.0.1", port));

    let (result, saw_error) = runner.join().unwrap();
    result.unwrap();
    assert!(!saw_error);
}
