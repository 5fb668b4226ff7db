use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use std::os::unix::io::FromRawFd;

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use nix::unistd;
use tracing::{debug, info, warn};

use crate::record::{ProductLog, SinkSettings};
use crate::recv::{self, ReceiverConfig, RecvHooks};
use crate::{control, Error};

/// Nap when the worker pool is saturated.
pub const MAX_WORKER_SLEEP: Duration = Duration::from_secs(30);
/// Nap after a failed accept before recreating the listen socket.
pub const RECOVER_SLEEP: Duration = Duration::from_secs(3);

const LISTEN_BACKLOG: usize = 10;

struct Worker {
    handle: JoinHandle<Result<(), Error>>,
    peer: String,
}

/// Accepts connections and runs one share-nothing worker per connection,
/// capped at `max_worker`. With `max_worker == 0` the service runs inline on
/// the dispatcher itself.
pub struct Dispatcher {
    cfg: Arc<ReceiverConfig>,
    hooks: Arc<dyn RecvHooks>,
    sink: Option<SinkSettings>,
    program: String,
    listener: Option<TcpListener>,
    workers: Vec<Option<Worker>>,
    saw_error: bool,
}

impl Dispatcher {
    pub fn new(
        cfg: ReceiverConfig,
        hooks: Arc<dyn RecvHooks>,
        sink: Option<SinkSettings>,
    ) -> Self {
        let program = match &cfg.source_suffix {
            Some(suffix) => format!("receiver-{suffix}"),
            None => "receiver".to_owned(),
        };
        let slots = cfg.max_worker.max(1);

        Dispatcher {
            cfg: Arc::new(cfg),
            hooks,
            sink,
            program,
            listener: None,
            workers: (0..slots).map(|_| None).collect(),
            saw_error: false,
        }
    }

    /// True when any connection ended in error since startup.
    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    /// Create the listen socket up front so bind failures surface as
    /// startup faults. Returns the bound port.
    pub fn bind(&mut self) -> Result<u16, Error> {
        let listener = self.make_listener()?;
        let port = listener.local_addr()?.port();
        info!("listening on port {port}");
        self.listener = Some(listener);
        Ok(port)
    }

    pub fn run(&mut self) -> Result<(), Error> {
        while !control::shutting_down() {
            if self.listener.is_none() {
                let listener = self.make_listener()?;
                info!("listening on port {}", self.cfg.port);
                self.listener = Some(listener);
            }

            self.reap();

            if self.cfg.max_worker > 0 && self.live_count() == self.cfg.max_worker {
                warn!("all {} worker slots busy, holding accepts", self.cfg.max_worker);
                sleep_checking_shutdown(MAX_WORKER_SLEEP);
                continue;
            }

            let listener = match &self.listener {
                Some(listener) => listener,
                None => continue,
            };

            let (sock, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}; recreating the listen socket");
                    self.listener = None;
                    sleep_checking_shutdown(RECOVER_SLEEP);
                    continue;
                }
            };
            let peer = addr.ip().to_string();
            debug!("accepted connection from {peer}");

            if self.cfg.max_worker == 0 {
                let mut log = self.open_worker_log(0);
                if let Err(e) = recv::service(sock, &peer, &self.cfg, self.hooks.as_ref(), &mut log)
                {
                    warn!("inline service for {peer} failed: {e}");
                    self.saw_error = true;
                }
                continue;
            }

            let slot = match self.workers.iter().position(Option::is_none) {
                Some(slot) => slot,
                None => {
                    // Between reap and here nothing frees slots; treat as full.
                    sleep_checking_shutdown(MAX_WORKER_SLEEP);
                    continue;
                }
            };

            let cfg = Arc::clone(&self.cfg);
            let hooks = Arc::clone(&self.hooks);
            let mut log = self.open_worker_log(slot);
            let worker_peer = peer.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{slot}"))
                .spawn(move || recv::service(sock, &worker_peer, &cfg, hooks.as_ref(), &mut log))?;

            self.workers[slot] = Some(Worker { handle, peer });
        }

        self.drain();
        self.listener = None;
        Ok(())
    }

    fn live_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.as_ref().is_some_and(|w| !w.handle.is_finished()))
            .count()
    }

    /// Join workers whose connection has ended and clear their slots.
    fn reap(&mut self) {
        for slot in self.workers.iter_mut() {
            if !slot.as_ref().is_some_and(|w| w.handle.is_finished()) {
                continue;
            }
            if let Some(worker) = slot.take() {
                match worker.handle.join() {
                    Ok(Ok(())) => debug!("worker for {} finished", worker.peer),
                    Ok(Err(e)) => {
                        warn!("worker for {} failed: {e}", worker.peer);
                        self.saw_error = true;
                    }
                    Err(_) => {
                        warn!("worker for {} panicked", worker.peer);
                        self.saw_error = true;
                    }
                }
            }
        }
    }

    /// Wait for every live worker. They observe the shutdown flag and their
    /// socket timeouts, so this terminates.
    fn drain(&mut self) {
        for slot in self.workers.iter_mut() {
            if let Some(worker) = slot.take() {
                match worker.handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("worker for {} failed during drain: {e}", worker.peer);
                        self.saw_error = true;
                    }
                    Err(_) => {
                        warn!("worker for {} panicked", worker.peer);
                        self.saw_error = true;
                    }
                }
            }
        }
    }

    fn make_listener(&self) -> Result<TcpListener, Error> {
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )?;

        let prepared: Result<(), nix::Error> = (|| {
            socket::setsockopt(fd, sockopt::ReuseAddr, &true)?;
            socket::bind(fd, &SockaddrIn::new(0, 0, 0, 0, self.cfg.port))?;
            socket::listen(fd, LISTEN_BACKLOG)?;
            Ok(())
        })();

        match prepared {
            Ok(()) => Ok(unsafe { TcpListener::from_raw_fd(fd) }),
            Err(e) => {
                let _ = unistd::close(fd);
                Err(e.into())
            }
        }
    }

    fn open_worker_log(&self, slot: usize) -> ProductLog {
        match &self.sink {
            Some(settings) => {
                let name = format!("{}-w{slot}.product", self.program);
                ProductLog::open(settings.clone(), &name).unwrap_or_else(|e| {
                    warn!("cannot open product sink {name}: {e}");
                    ProductLog::disabled()
                })
            }
            None => ProductLog::disabled(),
        }
    }
}

fn sleep_checking_shutdown(dur: Duration) {
    let step = Duration::from_millis(250);
    let mut left = dur;
    while !control::shutting_down() && !left.is_zero() {
        let nap = left.min(step);
        thread::sleep(nap);
        left = left.saturating_sub(nap);
    }
}
