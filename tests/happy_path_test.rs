use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use prodlink::record::{ProductLog, SinkSettings};
use prodlink::recv::{self, DefaultHooks, ReceiverConfig};
use prodlink::sender::{Sender, SenderConfig};

fn sink_settings(dir: PathBuf) -> SinkSettings {
    SinkSettings {
        dir,
        max_size: 1 << 20,
        flush_interval: Duration::from_secs(0),
        archive: false,
    }
}

#[test]
fn one_file_travels_end_to_end() {
    let _ = tracing_subscriber::fmt::try_init();

    let work = tempfile::tempdir().unwrap();
    let indir = work.path().join("in");
    let outdir = work.path().join("out");
    let logdir = work.path().join("log");
    fs::create_dir_all(&indir).unwrap();
    fs::create_dir_all(&outdir).unwrap();

    let payload = vec![0x55u8; 1024];
    fs::write(indir.join("product"), &payload).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let recv_cfg = ReceiverConfig {
        port,
        timeout: Duration::from_secs(5),
        outdir: outdir.clone(),
        toggle_perms: true,
        ..ReceiverConfig::default()
    };
    let recv_log_dir = logdir.clone();
    let server = thread::spawn(move || {
        let (sock, addr) = listener.accept().unwrap();
        let mut log =
            ProductLog::open(sink_settings(recv_log_dir), "receiver-w0.product").unwrap();
        recv::service(sock, &addr.ip().to_string(), &recv_cfg, &DefaultHooks, &mut log)
    });

    let send_cfg = SenderConfig {
        hosts: vec!["127.0.0.1".to_owned()],
        port,
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        window_size: 3,
        dirs: vec![indir.clone()],
        sent_count: 1000,
        sent_dir: work.path().join("sent"),
        fail_dir: work.path().join("fail"),
        ..SenderConfig::default()
    };
    let send_log = ProductLog::open(sink_settings(logdir.clone()), "sender.product").unwrap();
    let mut engine = Sender::new(send_cfg, send_log);

    let sent_file = work.path().join("sent/000");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !sent_file.exists() && Instant::now() < deadline {
        engine.tick().unwrap();
    }

    // The file rotated into the first sent slot and left the input dir.
    assert_eq!(fs::read(&sent_file).unwrap(), payload);
    assert!(!indir.join("product").exists());

    // The receiver stored it under the pid-seqno scheme.
    let out_file = outdir.join(format!("{}-000000", std::process::id()));
    assert_eq!(fs::read(&out_file).unwrap(), payload);

    drop(engine);
    server.join().unwrap().unwrap();

    // Both product sinks recorded the completed product.
    let sender_log = fs::read_to_string(logdir.join("sender.product.log")).unwrap();
    assert!(sender_log.contains("END 00000"));
    assert!(sender_log.contains("CONNECT"));
    let receiver_log = fs::read_to_string(logdir.join("receiver-w0.product.log")).unwrap();
    assert!(receiver_log.contains("END 00000"));
}
