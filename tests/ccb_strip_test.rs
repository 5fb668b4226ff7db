use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use prodlink::record::ProductLog;
use prodlink::recv::{self, ReceiverConfig, RecvHooks};
use prodlink::sender::{Sender, SenderConfig};
use prodlink::wire::WmoHeading;

/// Default storage, but remembers the heading the receiver parsed.
struct HeadingSpy {
    seen: Mutex<Option<WmoHeading>>,
}

impl RecvHooks for HeadingSpy {
    fn out_path(&self, outdir: &Path, wmo: Option<&WmoHeading>, seqno: u32) -> PathBuf {
        *self.seen.lock().unwrap() = wmo.cloned();
        outdir.join(format!("{}-{:06}", std::process::id(), seqno % 1_000_000))
    }
}

/// Scenario: a file opening with a 24-byte CCB preamble is sent with
/// stripping enabled. The wire carries `file_size - 24` bytes and the
/// receiver sees the WMO heading that followed the preamble.
#[test]
fn ccb_preamble_is_stripped_in_transit() {
    let _ = tracing_subscriber::fmt::try_init();

    let work = tempfile::tempdir().unwrap();
    let indir = work.path().join("in");
    let outdir = work.path().join("out");
    fs::create_dir_all(&indir).unwrap();
    fs::create_dir_all(&outdir).unwrap();

    // 0x40 flag, 0x0C two-byte units = 24 preamble bytes, then the product.
    let mut original = vec![0u8; 24];
    original[0] = 0x40;
    original[1] = 0x0C;
    let body = b"SXUS20 KWBC 121200\r\r\nobservation body".to_vec();
    original.extend_from_slice(&body);
    fs::write(indir.join("product"), &original).unwrap();

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
        let hooks = HeadingSpy {
            seen: Mutex::new(None),
        };
        let mut log = ProductLog::disabled();
        let result = recv::service(sock, &addr.ip().to_string(), &recv_cfg, &hooks, &mut log);
        (result, hooks.seen.into_inner().unwrap())
    });

    let send_cfg = SenderConfig {
        hosts: vec!["127.0.0.1".to_owned()],
        port,
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        window_size: 3,
        strip_ccb: true,
        dirs: vec![indir.clone()],
        sent_count: 10,
        sent_dir: work.path().join("sent"),
        fail_dir: work.path().join("fail"),
        ..SenderConfig::default()
    };
    let mut engine = Sender::new(send_cfg, ProductLog::disabled());

    let sent_file = work.path().join("sent/0");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !sent_file.exists() && Instant::now() < deadline {
        engine.tick().unwrap();
    }

    // On disk at the receiver: the original minus its first 24 bytes.
    let out_file = outdir.join(format!("{}-000000", std::process::id()));
    assert_eq!(fs::read(&out_file).unwrap(), body);

    drop(engine);
    let (result, seen) = server.join().unwrap();
    result.unwrap();

    // The receiver's WMO parser saw the post-CCB payload.
    let seen = seen.expect("receiver should have parsed a heading");
    assert_eq!(seen.ttaaii, "SXUS20");
    assert_eq!(seen.cccc, "KWBC");
}
