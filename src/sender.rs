use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use std::os::unix::io::AsRawFd;

use nix::poll::{poll, PollFd, PollFlags};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::announce;
use crate::product::{Product, ProductState, ProductTable};
use crate::queue::{DirQueue, SentArea};
use crate::record::ProductLog;
use crate::wire::{self, AckCode, ACK_LEN, HDR_LEN, MAX_PROD_SEQNO};
use crate::{control, now_epoch, Error};

/// Back off this long after repeated connect or input failures.
pub const RECOVERY_SLEEP: Duration = Duration::from_secs(20);

const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Destination hosts, tried round-robin.
    pub hosts: Vec<String>,
    pub port: u16,
    /// Per-operation network deadline and ack timeout.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Products older than this are evicted unsent.
    pub queue_ttl: Option<Duration>,
    pub window_size: usize,
    /// Negative means unbounded.
    pub max_retry: i32,
    pub bufsize: usize,
    /// Announce the connection under this heading.
    pub connect_wmo: Option<String>,
    pub source: Option<String>,
    pub strip_ccb: bool,
    pub dirs: Vec<PathBuf>,
    pub wait_last_file: bool,
    pub refresh_interval: u64,
    pub max_queue_len: usize,
    pub sent_count: u32,
    pub sent_dir: PathBuf,
    pub fail_dir: PathBuf,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            hosts: vec!["localhost".to_owned()],
            port: 5001,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            queue_ttl: None,
            window_size: 8,
            max_retry: -1,
            bufsize: 16 * 1024,
            connect_wmo: None,
            source: None,
            strip_ccb: false,
            dirs: vec![PathBuf::from("data")],
            wait_last_file: false,
            refresh_interval: 0,
            max_queue_len: 1024,
            sent_count: 100,
            sent_dir: PathBuf::from("sent"),
            fail_dir: PathBuf::from("fail"),
        }
    }
}

enum TxOutcome {
    /// Frame fully on the wire; the product moved to the ack list.
    Sent,
    /// Could not make progress; the product stays current.
    Transient,
    /// The product can never be sent; abort it.
    Failed(&'static str),
    /// The connection died mid-send; replay after reconnect.
    Lost,
}

enum SendFault {
    Retry,
    Lost,
}

/// The sliding-window send/ack engine. Single-threaded; every blocking call
/// carries a deadline and the control flags are observed between steps.
pub struct Sender {
    cfg: SenderConfig,
    table: ProductTable,
    queue: DirQueue,
    area: SentArea,
    log: ProductLog,
    buf: Vec<u8>,
    sock: Option<TcpStream>,
    seqno: u32,
    host_idx: usize,
    connect_failures: u32,
    input_failures: u32,
    announce_slot: Option<usize>,
    announce_file: Option<NamedTempFile>,
}

impl Sender {
    pub fn new(cfg: SenderConfig, log: ProductLog) -> Self {
        let table = ProductTable::new(cfg.window_size.max(1));
        let queue = DirQueue::new(
            cfg.dirs.clone(),
            cfg.refresh_interval,
            cfg.max_queue_len,
            cfg.wait_last_file,
        );
        let area = SentArea::new(
            cfg.sent_dir.clone(),
            cfg.fail_dir.clone(),
            cfg.sent_count.max(1),
        );
        let buf = vec![0u8; cfg.bufsize.max(HDR_LEN + 1)];

        Sender {
            cfg,
            table,
            queue,
            area,
            log,
            buf,
            sock: None,
            seqno: 0,
            host_idx: 0,
            connect_failures: 0,
            input_failures: 0,
            announce_slot: None,
            announce_file: None,
        }
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.log.record(
            "START",
            format_args!(
                "window {} to {:?}:{}",
                self.table.window_size(),
                self.cfg.hosts,
                self.cfg.port
            ),
        );

        while !control::shutting_down() {
            self.tick()?;
        }

        self.log.record("EXIT", format_args!("shutdown"));
        self.log.flush();
        Ok(())
    }

    /// One pass of the engine loop. Public so tests can drive the engine
    /// step by step; returns whether the pass made progress.
    pub fn tick(&mut self) -> Result<bool, Error> {
        let mut progress = false;

        // A flagged disconnect tears the socket down. Acks for anything
        // still outstanding are presumed lost, so the ack list replays, and
        // a configured announcement is rebuilt for the next connection.
        if control::disconnected() {
            if self.sock.take().is_some() {
                info!("connection closed, in-flight products will replay");
            }
            control::clear(control::DISCONNECT | control::NO_PEER);
            self.table.drain_ack_to_retr(self.announce_slot);
            if self.cfg.connect_wmo.is_some() {
                self.synthesize_announcement()?;
            }
        }

        if self.sock.is_none() {
            if self.cfg.connect_wmo.is_some() && self.announce_slot.is_none() {
                self.synthesize_announcement()?;
            }
            match self.connect_next() {
                Ok(sock) => {
                    self.sock = Some(sock);
                    self.seqno = 0;
                    self.connect_failures = 0;
                    progress = true;
                }
                Err(e) => {
                    self.connect_failures += 1;
                    warn!(
                        "connect failed ({} in a row): {e}",
                        self.connect_failures
                    );
                    self.idle_sleep();
                    return Ok(false);
                }
            }
        }

        // Pull the next product into the window when there is room.
        if self.table.retr_head().is_none() && self.table.ack_len() < self.table.window_size() {
            let (queue_len, cand) = self.queue.next(&self.table);
            if let Some(cand) = cand {
                match self.table.take_free() {
                    Some(idx) => {
                        let slot = self.table.slot_mut(idx);
                        *slot = Product {
                            filename: cand.filename,
                            size: cand.size,
                            queue_time: cand.queue_time,
                            priority: cand.priority,
                            state: ProductState::Queued,
                            ..Product::default()
                        };
                        self.table.push_retr(idx);
                        self.log.record(
                            "STATUS",
                            format_args!(
                                "{queue_len} queued, {} awaiting ack",
                                self.table.ack_len()
                            ),
                        );
                    }
                    None => {
                        if !self.table.consistent() {
                            self.table.rebuild();
                        }
                    }
                }
            }
        }

        progress |= self.evict_expired();

        if self.sock.is_some() {
            if let Some(idx) = self.table.retr_head() {
                match self.transmit(idx) {
                    TxOutcome::Sent => {
                        self.table.pop_retr();
                        self.table.push_ack(idx);
                        self.input_failures = 0;
                        progress = true;
                    }
                    TxOutcome::Failed(reason) => {
                        self.table.pop_retr();
                        self.abort_slot(idx, reason);
                        self.input_failures += 1;
                        progress = true;
                    }
                    TxOutcome::Transient => {
                        self.input_failures += 1;
                    }
                    TxOutcome::Lost => {}
                }
            }
        }

        if self.sock.is_some() && self.table.ack_len() > 0 {
            progress |= self.recv_acks()?;
        }

        if !progress {
            self.idle_sleep();
        }
        Ok(progress)
    }

    /// Evict retr-list heads whose queue TTL has lapsed. They die without a
    /// byte ever hitting the socket.
    fn evict_expired(&mut self) -> bool {
        let Some(ttl) = self.cfg.queue_ttl else {
            return false;
        };

        let mut evicted = false;
        while let Some(idx) = self.table.retr_head() {
            let prod = self.table.slot(idx);
            if prod.announcement
                || now_epoch().saturating_sub(prod.queue_time) <= ttl.as_secs()
            {
                break;
            }

            self.table.pop_retr();
            self.table.slot_mut(idx).state = ProductState::Dead;
            self.abort_slot(idx, "ttl");
            evicted = true;
        }
        evicted
    }

    fn abort_slot(&mut self, idx: usize, reason: &str) {
        if Some(idx) == self.announce_slot {
            self.announce_slot = None;
            self.announce_file = None;
        } else if let Err(e) = self.area.abort(self.table.slot(idx), reason, &mut self.log) {
            warn!(
                "cannot move {} to the fail area: {e}",
                self.table.slot(idx).filename.display()
            );
        }
        self.table.release(idx);
    }

    fn connect_next(&mut self) -> Result<TcpStream, Error> {
        if self.cfg.hosts.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no hosts configured").into());
        }
        let host = self.cfg.hosts[self.host_idx % self.cfg.hosts.len()].clone();

        let result = (|| {
            let addrs = (host.as_str(), self.cfg.port).to_socket_addrs()?;
            let mut last =
                io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to nothing");
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, self.cfg.timeout) {
                    Ok(sock) => return Ok(sock),
                    Err(e) => last = e,
                }
            }
            Err(last)
        })();

        match result {
            Ok(sock) => {
                sock.set_read_timeout(Some(self.cfg.timeout))?;
                sock.set_write_timeout(Some(self.cfg.timeout))?;
                sock.set_nodelay(true)?;
                info!("connected to {host}:{}", self.cfg.port);
                self.log
                    .record("CONNECT", format_args!("{host}:{}", self.cfg.port));
                Ok(sock)
            }
            Err(e) => {
                // Rotate to the next alternate for the following attempt.
                self.host_idx = (self.host_idx + 1) % self.cfg.hosts.len();
                Err(e.into())
            }
        }
    }

    /// Build (or rebuild) the announcement product and put it at the very
    /// front of the retr list so it is the first frame on the connection.
    fn synthesize_announcement(&mut self) -> Result<(), Error> {
        let Some(ttaaii) = self.cfg.connect_wmo.clone() else {
            return Ok(());
        };

        let link_id = self.cfg.port.to_string();
        let file = announce::build_announcement(&ttaaii, self.cfg.source.as_deref(), &link_id)?;
        let size = file.as_file().metadata()?.len();

        let idx = match self.announce_slot {
            Some(idx) => {
                self.table.unlink(idx);
                idx
            }
            None => match self.table.take_free() {
                Some(idx) => idx,
                None => {
                    // Every slot carries a data product; hand the youngest
                    // back to the directory scan to make room.
                    match self.table.steal_retr_tail() {
                        Some(tail) => {
                            debug!(
                                "returning {} to the scan to make room for the announcement",
                                self.table.slot(tail).filename.display()
                            );
                            self.table.release(tail);
                            match self.table.take_free() {
                                Some(idx) => idx,
                                None => return Ok(()),
                            }
                        }
                        None => return Ok(()),
                    }
                }
            },
        };

        let slot = self.table.slot_mut(idx);
        *slot = Product {
            filename: file.path().to_owned(),
            size,
            state: ProductState::Queued,
            queue_time: now_epoch(),
            priority: u32::MAX,
            announcement: true,
            ..Product::default()
        };
        self.table.push_retr_front(idx);
        self.announce_slot = Some(idx);
        self.announce_file = Some(file);
        Ok(())
    }

    /// Transmit the product in `idx`: header plus payload, CCB stripped when
    /// configured, WMO parsed from the first block.
    fn transmit(&mut self, idx: usize) -> TxOutcome {
        let (filename, queue_time, send_count, needs_wmo) = {
            let prod = self.table.slot(idx);
            (
                prod.filename.clone(),
                prod.queue_time,
                prod.send_count,
                prod.wmo.is_none(),
            )
        };

        if self.cfg.max_retry >= 0 && send_count > self.cfg.max_retry as u32 {
            self.table.slot_mut(idx).state = ProductState::Failed;
            return TxOutcome::Failed("retries");
        }

        let mut file = match File::open(&filename) {
            Ok(file) => file,
            Err(e) => {
                warn!("cannot open {}: {e}", filename.display());
                self.table.slot_mut(idx).state = ProductState::Failed;
                return TxOutcome::Failed("open");
            }
        };
        let file_size = match file.metadata() {
            Ok(md) => md.len(),
            Err(e) => {
                warn!("cannot stat {}: {e}", filename.display());
                self.table.slot_mut(idx).state = ProductState::Failed;
                return TxOutcome::Failed("stat");
            }
        };

        // First block: 32 bytes reserved for the header, payload after it.
        let first = match read_retry(&mut file, &mut self.buf[HDR_LEN..]) {
            Ok(n) => n,
            Err(e) => {
                warn!("read {} failed: {e}", filename.display());
                self.table.slot_mut(idx).state = ProductState::Failed;
                return TxOutcome::Failed("read");
            }
        };

        let ccb = if self.cfg.strip_ccb {
            wire::ccb_len(&self.buf[HDR_LEN..HDR_LEN + first])
        } else {
            0
        };
        let payload_size = file_size - ccb as u64;

        let wmo = if needs_wmo {
            wire::parse_wmo(&self.buf[HDR_LEN + ccb..HDR_LEN + first])
        } else {
            None
        };

        let header = match wire::format_header(self.seqno, payload_size, queue_time) {
            Ok(header) => header,
            Err(e) => {
                warn!("{} not sendable: {e}", filename.display());
                self.table.slot_mut(idx).state = ProductState::Failed;
                return TxOutcome::Failed("size");
            }
        };
        self.buf[..HDR_LEN].copy_from_slice(&header);
        if ccb > 0 {
            self.buf.copy_within(HDR_LEN + ccb..HDR_LEN + first, HDR_LEN);
        }

        let Some(sock) = self.sock.as_mut() else {
            return TxOutcome::Transient;
        };

        let mut sent: u64 = (first - ccb) as u64;
        match send_all(sock, &self.buf[..HDR_LEN + first - ccb]) {
            Ok(()) => {}
            Err(SendFault::Retry) => {
                self.table.slot_mut(idx).state = ProductState::Retry;
                return TxOutcome::Transient;
            }
            Err(SendFault::Lost) => return TxOutcome::Lost,
        }

        while sent < payload_size {
            let want = ((payload_size - sent) as usize).min(self.buf.len());
            let n = match read_retry(&mut file, &mut self.buf[..want]) {
                Ok(n) => n,
                Err(e) => {
                    warn!("read {} failed mid-send: {e}", filename.display());
                    control::set(control::DISCONNECT);
                    self.table.slot_mut(idx).state = ProductState::Failed;
                    return TxOutcome::Failed("read");
                }
            };
            if n == 0 {
                // The file shrank underfoot; the frame can never be
                // completed, so the connection is forfeit too.
                warn!("{} changed size mid-send", filename.display());
                control::set(control::DISCONNECT);
                self.table.slot_mut(idx).state = ProductState::Failed;
                return TxOutcome::Failed("size-changed");
            }

            match send_all(sock, &self.buf[..n]) {
                Ok(()) => sent += n as u64,
                Err(SendFault::Retry) => {
                    self.table.slot_mut(idx).state = ProductState::Retry;
                    return TxOutcome::Transient;
                }
                Err(SendFault::Lost) => return TxOutcome::Lost,
            }
        }

        let seqno = self.seqno;
        self.seqno = (self.seqno + 1) % (MAX_PROD_SEQNO + 1);

        let prod = self.table.slot_mut(idx);
        prod.seqno = seqno;
        prod.size = payload_size;
        prod.ccb_len = ccb;
        if let Some(wmo) = wmo {
            prod.wmo = Some(wmo);
        }
        prod.state = ProductState::Sent;
        prod.send_count += 1;
        prod.send_time = Some(Instant::now());
        debug!(
            "sent {:05} {} ({payload_size} bytes, attempt {})",
            seqno,
            prod.filename.display(),
            prod.send_count
        );

        TxOutcome::Sent
    }

    /// Receive acks, one at a time, always matching the head of the ack
    /// list. Blocks up to the head's deadline only when the window is full.
    fn recv_acks(&mut self) -> Result<bool, Error> {
        let mut progress = false;

        loop {
            let Some(head) = self.table.ack_head() else {
                break;
            };
            let Some(sock) = self.sock.as_mut() else {
                break;
            };

            let send_time = self.table.slot(head).send_time.unwrap_or_else(Instant::now);
            let deadline = send_time + self.cfg.timeout;
            let window_full = self.table.ack_len() == self.table.window_size();

            let wait = if window_full {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            let mut fds = [PollFd::new(sock.as_raw_fd(), PollFlags::POLLIN)];
            let timeout_ms = wait.as_millis().min(i32::MAX as u128) as i32;
            let ready = match poll(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => {
                    if control::test(control::SHUTDOWN | control::DISCONNECT) {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if ready == 0 {
                if Instant::now() >= deadline {
                    warn!(
                        "ack for {:05} overdue, dropping the connection",
                        self.table.slot(head).seqno
                    );
                    control::set(control::DISCONNECT);
                }
                break;
            }

            let mut ack_buf = [0u8; ACK_LEN];
            match sock.read_exact(&mut ack_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    control::set(control::DISCONNECT | control::NO_PEER);
                    break;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    control::set(control::DISCONNECT);
                    break;
                }
                Err(e) => {
                    warn!("ack read failed: {e}");
                    control::set(control::DISCONNECT | control::NO_PEER);
                    break;
                }
            }

            let ack = match wire::parse_ack(&ack_buf) {
                Ok(ack) => ack,
                Err(e) => {
                    warn!("unparseable ack, dropping the connection: {e}");
                    control::set(control::DISCONNECT);
                    break;
                }
            };

            let head_seqno = self.table.slot(head).seqno;
            if ack.seqno != head_seqno {
                warn!(
                    "ack {:05} does not match window head {:05}, dropping the connection",
                    ack.seqno, head_seqno
                );
                control::set(control::DISCONNECT);
                break;
            }

            self.table.pop_ack();
            progress = true;

            let is_announcement = Some(head) == self.announce_slot;
            match ack.code {
                AckCode::Ok => {
                    self.table.slot_mut(head).state = ProductState::Acked;
                    if is_announcement {
                        self.log.record("END", format_args!("{head_seqno:05} announcement"));
                        self.announce_slot = None;
                        self.announce_file = None;
                    } else if let Err(e) =
                        self.area.finish(self.table.slot(head), &mut self.log)
                    {
                        warn!(
                            "cannot move {} to the sent area: {e}",
                            self.table.slot(head).filename.display()
                        );
                    }
                    self.table.release(head);
                }
                AckCode::Fail => {
                    self.table.slot_mut(head).state = ProductState::Nacked;
                    self.abort_slot(head, "nack");
                }
                AckCode::Retransmit => {
                    if is_announcement {
                        // Retrying an announcement on the same connection is
                        // meaningless; start the connection over.
                        warn!("receiver asked to retry the announcement");
                        self.announce_slot = None;
                        self.announce_file = None;
                        self.table.release(head);
                        control::set(control::DISCONNECT);
                        break;
                    }
                    let prod = self.table.slot_mut(head);
                    prod.state = ProductState::Retry;
                    self.area.retry(self.table.slot(head), &mut self.log);
                    self.table.push_retr(head);
                }
            }

            if !self.table.consistent() {
                self.table.rebuild();
            }
        }

        Ok(progress)
    }

    fn idle_sleep(&self) {
        let mut dur = self.cfg.poll_interval;

        if let Some(head) = self.table.ack_head() {
            if let Some(send_time) = self.table.slot(head).send_time {
                let left = (send_time + self.cfg.timeout).saturating_duration_since(Instant::now());
                dur = dur.min(left);
            }
        }
        if self.connect_failures >= FAILURE_THRESHOLD || self.input_failures >= FAILURE_THRESHOLD {
            dur = RECOVERY_SLEEP;
        }

        control::interruptible_sleep(dur.max(Duration::from_millis(10)));
    }
}

fn read_retry(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Push `data` fully onto the socket. Interrupts re-check the disconnect
/// flag; a deadline expiry or hard error forfeits the connection.
fn send_all(sock: &mut TcpStream, data: &[u8]) -> Result<(), SendFault> {
    let mut off = 0;
    while off < data.len() {
        match sock.write(&data[off..]) {
            Ok(0) => return Err(SendFault::Retry),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if control::test(control::SHUTDOWN | control::DISCONNECT) {
                    return Err(SendFault::Lost);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                control::set(control::DISCONNECT);
                return Err(SendFault::Lost);
            }
            Err(e) => {
                warn!("send failed: {e}");
                control::set(control::DISCONNECT | control::NO_PEER);
                return Err(SendFault::Lost);
            }
        }
    }
    Ok(())
}
