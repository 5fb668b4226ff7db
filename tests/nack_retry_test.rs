use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use prodlink::record::{ProductLog, SinkSettings};
use prodlink::recv::{self, ReceiverConfig, RecvHooks};
use prodlink::sender::{Sender, SenderConfig};

/// Declines the first stored product with a retransmit verdict, accepts the
/// second attempt.
struct FlakyHooks {
    strikes: AtomicU32,
}

impl RecvHooks for FlakyHooks {
    fn finish_recv(&self, _path: &Path) -> i32 {
        if self.strikes.fetch_add(1, Ordering::SeqCst) == 0 {
            1
        } else {
            0
        }
    }
}

fn sink_settings(dir: PathBuf) -> SinkSettings {
    SinkSettings {
        dir,
        max_size: 1 << 20,
        flush_interval: Duration::from_secs(0),
        archive: false,
    }
}

#[test]
fn retransmit_request_is_honored_once() {
    let _ = tracing_subscriber::fmt::try_init();

    let work = tempfile::tempdir().unwrap();
    let indir = work.path().join("in");
    let outdir = work.path().join("out");
    let logdir = work.path().join("log");
    fs::create_dir_all(&indir).unwrap();
    fs::create_dir_all(&outdir).unwrap();

    fs::write(indir.join("product"), b"retry me").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let recv_cfg = ReceiverConfig {
        port,
        timeout: Duration::from_secs(5),
        outdir: outdir.clone(),
        toggle_perms: true,
        ..ReceiverConfig::default()
    };
    let server = thread::spawn(move || {
        let (sock, addr) = listener.accept().unwrap();
        let hooks = FlakyHooks {
            strikes: AtomicU32::new(0),
        };
        let mut log = ProductLog::disabled();
        recv::service(sock, &addr.ip().to_string(), &recv_cfg, &hooks, &mut log)
    });

    let send_cfg = SenderConfig {
        hosts: vec!["127.0.0.1".to_owned()],
        port,
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        window_size: 3,
        dirs: vec![indir.clone()],
        sent_count: 10,
        sent_dir: work.path().join("sent"),
        fail_dir: work.path().join("fail"),
        ..SenderConfig::default()
    };
    let send_log = ProductLog::open(sink_settings(logdir.clone()), "sender.product").unwrap();
    let mut engine = Sender::new(send_cfg, send_log);

    let sent_file = work.path().join("sent/0");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !sent_file.exists() && Instant::now() < deadline {
        engine.tick().unwrap();
    }

    assert_eq!(fs::read(&sent_file).unwrap(), b"retry me");
    assert!(!indir.join("product").exists());

    // The second transmission carried seqno 1 and landed.
    let out_file = outdir.join(format!("{}-000001", std::process::id()));
    assert_eq!(fs::read(&out_file).unwrap(), b"retry me");

    drop(engine);
    server.join().unwrap().unwrap();

    // The sender observed one retransmit request, then success in 2 sends.
    let sender_log = fs::read_to_string(logdir.join("sender.product.log")).unwrap();
    assert!(sender_log.contains("RETRY[1]"));
    assert!(sender_log.contains("2 send(s)"));
}
