use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use std::os::unix::fs::OpenOptionsExt;

use nix::libc;
use tracing::{debug, info, warn};

use crate::announce::{self, ConnInfo};
use crate::record::ProductLog;
use crate::wire::{self, AckCode, FrameHeader, WmoHeading, HDR_LEN, MAX_PROD_SIZE};
use crate::{control, fsutil, Error};

/// The first buffer of a product must hold at least this much so the WMO
/// heading can be parsed before the output path is chosen.
pub const FIRST_BLK_SIZE: usize = 1024;

const SHORT_OPEN_SLEEP: Duration = Duration::from_secs(3);
const LONG_OPEN_SLEEP: Duration = Duration::from_secs(30);
const MAX_OPEN_ATTEMPTS: u32 = 10;

/// Announcements are tiny; cap what we keep of an oversized one.
const MAX_ANNOUNCE_KEEP: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub port: u16,
    pub max_worker: usize,
    pub timeout: Duration,
    pub bufsize: usize,
    pub source_suffix: Option<String>,
    pub outdir: PathBuf,
    pub overwrite: bool,
    pub toggle_perms: bool,
    pub connect_wmo: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            port: 5001,
            max_worker: 4,
            timeout: Duration::from_secs(60),
            bufsize: 16 * 1024,
            source_suffix: None,
            outdir: PathBuf::from("incoming"),
            overwrite: false,
            toggle_perms: false,
            connect_wmo: None,
        }
    }
}

/// Narrow seam to the surrounding system: output naming and the post-store
/// verdict. The defaults implement the stand-alone behavior.
pub trait RecvHooks: Send + Sync {
    /// Where a product lands. The default ignores the heading and uses the
    /// `<pid>-<seqno>` scheme.
    fn out_path(&self, outdir: &Path, wmo: Option<&WmoHeading>, seqno: u32) -> PathBuf {
        let _ = wmo;
        outdir.join(format!("{}-{:06}", std::process::id(), seqno % 1_000_000))
    }

    /// Verdict on a fully stored product: negative fails it for good,
    /// positive requests a retransmit, zero accepts it.
    fn finish_recv(&self, path: &Path) -> i32 {
        let _ = path;
        0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl RecvHooks for DefaultHooks {}

/// Read into `buf` until at least `min` bytes have arrived.
///
/// `Ok(0)` means the peer closed before the first byte; closing mid-block is
/// an error. Interrupts re-check the shutdown flag; the configured socket
/// timeout surfaces as [`Error::RecvTimeout`].
pub fn recv_block(sock: &mut TcpStream, buf: &mut [u8], min: usize) -> Result<usize, Error> {
    let mut got = 0;
    while got < min {
        match sock.read(&mut buf[got..]) {
            Ok(0) => {
                return if got == 0 {
                    Ok(0)
                } else {
                    Err(Error::PeerClosed)
                };
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if control::shutting_down() {
                    return Err(Error::Shutdown);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(Error::RecvTimeout);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(got)
}

/// One accepted connection, serviced to completion.
pub struct Service<'a> {
    sock: TcpStream,
    remote_host: String,
    cfg: &'a ReceiverConfig,
    hooks: &'a dyn RecvHooks,
    log: &'a mut ProductLog,
    buf: Vec<u8>,
    expected: u32,
    first: bool,
    conn_info: Option<ConnInfo>,
}

/// Run the receiver service on an accepted socket. Returns `Ok` when the
/// connection wound down cleanly (peer close, shutdown, idle timeout).
pub fn service(
    sock: TcpStream,
    remote_host: &str,
    cfg: &ReceiverConfig,
    hooks: &dyn RecvHooks,
    log: &mut ProductLog,
) -> Result<(), Error> {
    let mut svc = Service::new(sock, remote_host, cfg, hooks, log)?;
    svc.run()
}

impl<'a> Service<'a> {
    pub fn new(
        sock: TcpStream,
        remote_host: &str,
        cfg: &'a ReceiverConfig,
        hooks: &'a dyn RecvHooks,
        log: &'a mut ProductLog,
    ) -> Result<Self, Error> {
        sock.set_read_timeout(Some(cfg.timeout))?;
        sock.set_write_timeout(Some(cfg.timeout))?;

        Ok(Service {
            sock,
            remote_host: remote_host.to_owned(),
            cfg,
            hooks,
            log,
            buf: vec![0u8; cfg.bufsize.max(FIRST_BLK_SIZE)],
            expected: 0,
            first: true,
            conn_info: None,
        })
    }

    pub fn conn_info(&self) -> Option<&ConnInfo> {
        self.conn_info.as_ref()
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.log
            .record("START", format_args!("connection from {}", self.remote_host));

        let result = self.record_loop();

        let outcome = match &result {
            Ok(()) => "clean",
            Err(e) => {
                warn!("connection from {} failed: {e}", self.remote_host);
                "error"
            }
        };
        self.log.record("EXIT", format_args!("{outcome}"));
        self.log.flush();

        result
    }

    fn record_loop(&mut self) -> Result<(), Error> {
        loop {
            if control::shutting_down() {
                return Ok(());
            }

            let mut hdr_buf = [0u8; HDR_LEN];
            let n = match recv_block(&mut self.sock, &mut hdr_buf, HDR_LEN) {
                Ok(n) => n,
                Err(Error::Shutdown) => return Ok(()),
                // An idle sender beyond the timeout is dropped, not failed.
                Err(Error::RecvTimeout) => {
                    debug!("idle connection from {} timed out", self.remote_host);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                return Ok(());
            }

            let hdr = wire::parse_header(&hdr_buf)?;
            if hdr.seqno != self.expected && hdr.seqno != 0 {
                return Err(Error::SeqnoMismatch {
                    got: hdr.seqno,
                    expected: self.expected,
                });
            }
            if hdr.size == 0 || hdr.size > MAX_PROD_SIZE {
                return Err(Error::SizeOutOfRange(hdr.size));
            }
            if hdr.seqno == 0 && self.expected != 0 {
                self.log.record("STATUS", format_args!("sequence reset to 0"));
            }

            let (code, fatal) = self.recv_product(&hdr)?;

            let ack = wire::format_ack(hdr.seqno, code)?;
            self.sock.write_all(&ack)?;

            if fatal {
                return Err(Error::BadAnnounce);
            }

            self.expected = hdr.seqno + 1;
            self.first = false;
        }
    }

    /// Receive one product body and classify the outcome. The second half of
    /// the pair is true when the connection must close after the ack.
    fn recv_product(&mut self, hdr: &FrameHeader) -> Result<(AckCode, bool), Error> {
        let size = hdr.size as usize;
        let first_need = size.min(FIRST_BLK_SIZE);
        let cap = size.min(self.buf.len());

        let got = match recv_block(&mut self.sock, &mut self.buf[..cap], first_need) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => n,
            Err(e) => return Err(e),
        };

        let wmo = wire::parse_wmo(&self.buf[..got]);

        if self.first && self.cfg.connect_wmo.is_some() {
            let want = self.cfg.connect_wmo.as_deref().unwrap_or_default();
            let heading = wmo
                .as_ref()
                .map(|w| w.ttaaii.clone())
                .or_else(|| announce::announce_ttaaii(&self.buf[..got]));

            let is_announcement = hdr.seqno == 0
                && heading
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(want));

            if is_announcement {
                return self.recv_announcement(size, got, heading.unwrap_or_default());
            }

            // The very first product must announce the connection.
            info!(
                "refusing {}: first product is not the {want} announcement",
                self.remote_host
            );
            self.discard(size - got)?;
            return Ok((AckCode::Fail, true));
        }

        self.store_product(hdr, size, got, wmo)
    }

    fn recv_announcement(
        &mut self,
        size: usize,
        got: usize,
        ttaaii: String,
    ) -> Result<(AckCode, bool), Error> {
        let mut payload = self.buf[..got].to_vec();
        let mut remaining = size - got;
        while remaining > 0 {
            let chunk = remaining.min(self.buf.len());
            let n = recv_block(&mut self.sock, &mut self.buf[..chunk], 1)?;
            if n == 0 {
                return Err(Error::PeerClosed);
            }
            if payload.len() < MAX_ANNOUNCE_KEEP {
                payload.extend_from_slice(&self.buf[..n]);
            }
            remaining -= n;
        }

        match announce::parse_announcement(&payload, &ttaaii) {
            Some(info) => {
                info!(
                    "announced connection: source {} link {} remote {}",
                    info.source, info.link_id, info.remotehost
                );
                let identity = format!("receiver-{}-{}.product", info.source, info.remotehost);
                if let Err(e) = self.log.rename_identity(&identity) {
                    warn!("cannot rename product sink to {identity}: {e}");
                }
                self.log
                    .record("CONNECT", format_args!("{} {}", info.source, info.remotehost));
                self.conn_info = Some(info);
                Ok((AckCode::Ok, false))
            }
            None => {
                info!("malformed announcement from {}", self.remote_host);
                Ok((AckCode::Fail, true))
            }
        }
    }

    fn store_product(
        &mut self,
        hdr: &FrameHeader,
        size: usize,
        first_got: usize,
        wmo: Option<WmoHeading>,
    ) -> Result<(AckCode, bool), Error> {
        let path = self.hooks.out_path(&self.cfg.outdir, wmo.as_ref(), hdr.seqno);

        let mut code = AckCode::Ok;
        let mut out = match open_with_recovery(&path, self.cfg.overwrite) {
            Ok(file) => Some(file),
            Err(Error::Shutdown) => return Err(Error::Shutdown),
            Err(e) => {
                warn!("cannot open {}: {e}", path.display());
                code = AckCode::Retransmit;
                None
            }
        };

        // Stream the body. A write failure aborts the file but we keep
        // reading through the declared size to stay byte-synchronized.
        let mut span = 0..first_got;
        let mut remaining = size - first_got;
        loop {
            if let Some(file) = out.as_mut() {
                if let Err(e) = file.write_all(&self.buf[span.clone()]) {
                    warn!("write to {} failed: {e}", path.display());
                    out = None;
                    let _ = fs::remove_file(&path);
                    code = AckCode::Retransmit;
                }
            }
            if remaining == 0 {
                break;
            }
            let chunk = remaining.min(self.buf.len());
            let n = match recv_block(&mut self.sock, &mut self.buf[..chunk], 1) {
                Ok(0) => 0,
                Ok(n) => n,
                Err(e) => {
                    if out.is_some() {
                        drop(out);
                        let _ = fs::remove_file(&path);
                    }
                    return Err(e);
                }
            };
            if n == 0 {
                if out.is_some() {
                    drop(out);
                    let _ = fs::remove_file(&path);
                }
                return Err(Error::PeerClosed);
            }
            span = 0..n;
            remaining -= n;
        }

        if let Some(file) = out.take() {
            drop(file);
            if self.cfg.toggle_perms {
                if let Err(e) = fsutil::set_readable(&path) {
                    warn!("cannot toggle permissions on {}: {e}", path.display());
                }
            }

            let verdict = self.hooks.finish_recv(&path);
            if verdict < 0 {
                code = AckCode::Fail;
                let _ = fs::remove_file(&path);
            } else if verdict > 0 {
                code = AckCode::Retransmit;
                let _ = fs::remove_file(&path);
            }
        }

        match code {
            AckCode::Ok => self.log.record(
                "END",
                format_args!("{:05} {} {} bytes", hdr.seqno, path.display(), size),
            ),
            AckCode::Retransmit => self
                .log
                .record("RETRY", format_args!("{:05} {}", hdr.seqno, path.display())),
            AckCode::Fail => self.log.record(
                "ABORT(refused)",
                format_args!("{:05} {}", hdr.seqno, path.display()),
            ),
        }

        Ok((code, false))
    }

    /// Read and drop the remainder of a product we will not store.
    fn discard(&mut self, mut remaining: usize) -> Result<(), Error> {
        while remaining > 0 {
            let chunk = remaining.min(self.buf.len());
            let n = recv_block(&mut self.sock, &mut self.buf[..chunk], 1)?;
            if n == 0 {
                return Err(Error::PeerClosed);
            }
            remaining -= n;
        }
        Ok(())
    }
}

/// Open the output file, recovering from the transient filesystem faults the
/// output tree is prone to. Bounded, and abandoned on shutdown.
fn open_with_recovery(path: &Path, overwrite: bool) -> Result<File, Error> {
    let mut attempts: u32 = 0;
    let mut repaired = false;

    loop {
        if control::shutting_down() {
            return Err(Error::Shutdown);
        }

        let mut opts = OpenOptions::new();
        opts.write(true).mode(fsutil::WRITE_ONLY_MODE);
        if overwrite {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }

        let err = match opts.open(path) {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };

        match err.raw_os_error() {
            Some(libc::EEXIST) | Some(libc::ENOSPC) => {
                attempts += 1;
                if attempts >= MAX_OPEN_ATTEMPTS {
                    return Err(err.into());
                }
                let nap = if attempts <= 3 {
                    SHORT_OPEN_SLEEP
                } else {
                    LONG_OPEN_SLEEP
                };
                debug!("open {} blocked ({err}), napping", path.display());
                shutdown_aware_sleep(nap);
            }
            Some(libc::ENOTDIR) if !repaired => {
                repaired = true;
                repair_not_dir(path)?;
            }
            Some(libc::ENOENT) if !repaired => {
                repaired = true;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            Some(libc::EISDIR) if !repaired => {
                repaired = true;
                fs::remove_dir(path)?;
            }
            Some(libc::EINTR) => continue,
            _ => return Err(err.into()),
        }
    }
}

/// An ancestor of `path` exists as a plain file; unlink it and rebuild the
/// directory chain.
fn repair_not_dir(path: &Path) -> Result<(), Error> {
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if let Ok(md) = fs::symlink_metadata(ancestor) {
            if !md.is_dir() {
                fs::remove_file(ancestor)?;
                break;
            }
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn shutdown_aware_sleep(dur: Duration) {
    let step = Duration::from_millis(250);
    let mut left = dur;
    while !control::shutting_down() && !left.is_zero() {
        let nap = left.min(step);
        std::thread::sleep(nap);
        left = left.saturating_sub(nap);
    }
}
