use std::future::Future;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{AppConfig, Credentials, PollConfig};
use crate::error::Error;
use crate::messages::{Command, DeviceCommand, Presence, Report, ReportSink, Request, sanitize_name};
use crate::tracker::PresenceTracker;

/// Consecutive failed polls after which a device's failures are logged as warnings.
pub const PERSISTENT_FAILURE_THRESHOLD: u32 = 10;

/// Alternating heartbeat value, independent of any device.
#[derive(Debug)]
pub struct Liveness {
    next: bool,
}

impl Liveness {
    pub fn new() -> Self {
        Liveness { next: true }
    }

    /// Returns the value to emit and flips the flag for the next pulse.
    pub fn toggle(&mut self) -> bool {
        let value = self.next;
        self.next = !value;
        value
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every tracker and drives short polls, long polls and operator commands.
pub struct Manager<S> {
    config: AppConfig,
    poll: PollConfig,
    credentials: Option<Arc<Credentials>>,
    trackers: Vec<PresenceTracker>,
    sink: S,
    liveness: Liveness,
    first_run: bool,
    notices: Vec<String>,
}

impl<S: ReportSink> Manager<S> {
    pub fn new(config: AppConfig, sink: S) -> Self {
        let poll = config.poll();
        Manager {
            config,
            poll,
            credentials: None,
            trackers: Vec::new(),
            sink,
            liveness: Liveness::new(),
            first_run: true,
            notices: Vec::new(),
        }
    }

    /// Whether the controller parameters were complete at startup.
    pub fn can_poll(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn start(&mut self) {
        info!("UniFi presence poller starting");
        self.check_params().await;
        self.discover();
        self.long_poll().await;
        self.send(Report::ControllerStatus(true)).await;
    }

    pub async fn stop(&mut self) {
        debug!("UniFi presence poller stopping");
        self.send(Report::ControllerStatus(false)).await;
    }

    /// Rebuilds the outstanding notices from the controller parameters. Any
    /// problem leaves the manager unable to poll until restarted.
    pub async fn check_params(&mut self) {
        self.notices.clear();

        match self.config.credentials() {
            Ok(credentials) => {
                debug!("Controller at {}", credentials.base_url);
                self.credentials = Some(Arc::new(credentials));
            }
            Err(errors) => {
                for err in &errors {
                    error!("check_params: {}", err);
                    self.notices.push(notice_for(err));
                }
                self.credentials = None;
            }
        }

        self.publish_notices().await;
    }

    /// Creates a tracker for every configured device that does not have one.
    /// Returns how many were added.
    pub fn discover(&mut self) -> usize {
        let Some(credentials) = self.credentials.clone() else {
            warn!("Controller parameters incomplete, not tracking any devices");
            return 0;
        };

        let mut added = 0;
        for entry in self.config.devices() {
            if self
                .trackers
                .iter()
                .any(|tracker| tracker.address() == entry.address)
            {
                continue;
            }
            info!("Tracking {} ({})", entry.name, entry.address);
            self.trackers.push(PresenceTracker::new(
                entry,
                credentials.clone(),
                self.poll.request_timeout(),
            ));
            added += 1;
        }
        added
    }

    /// Polls every device in turn. The first call also reports every
    /// device's state once.
    pub async fn short_poll(&mut self) {
        if !self.can_poll() {
            debug!("Skipping poll, controller parameters incomplete");
            return;
        }

        for tracker in &mut self.trackers {
            if let Err(err) = tracker.update(&self.sink).await {
                log_poll_failure(tracker, &err);
            }
        }

        if self.first_run {
            self.query().await;
            self.first_run = false;
        }
    }

    pub async fn long_poll(&mut self) {
        let value = self.liveness.toggle();
        debug!("heartbeat: {}", value);
        self.send(Report::Liveness(value)).await;
    }

    /// Reports the stored state of every device.
    pub async fn query(&self) {
        for tracker in &self.trackers {
            if let Err(err) = tracker.report_current(&self.sink).await {
                warn!("Could not report {}: {}", tracker.state().name, err);
            }
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        info!("Received command {}", command.name());
        match command {
            Command::Discover => {
                let added = self.discover();
                debug!("Discovery added {} devices", added);
            }
            Command::Query => self.query().await,
            Command::UpdateProfile => {
                if let Err(err) = self.sink.install_profile().await {
                    error!("Could not install profile: {}", err);
                }
            }
            Command::RemoveNoticesAll => {
                info!("Removing notices: {:?}", self.notices);
                self.notices.clear();
                self.publish_notices().await;
            }
        }
    }

    pub async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Controller(command) => self.handle_command(command).await,
            Request::Device { channel, command } => {
                self.handle_device_command(&channel, command).await
            }
        }
    }

    async fn handle_device_command(&mut self, channel: &str, command: DeviceCommand) {
        let Some(tracker) = self
            .trackers
            .iter_mut()
            .find(|tracker| sanitize_name(&tracker.state().name) == channel)
        else {
            warn!("No tracked device for {}/command/{}", channel, command.name());
            return;
        };

        info!("Received {} for {}", command.name(), tracker.state().name);
        let result = match command {
            DeviceCommand::SetOn => tracker.set_presence(Presence::OnNetwork, &self.sink).await,
            DeviceCommand::SetOff => tracker.set_presence(Presence::OffNetwork, &self.sink).await,
            DeviceCommand::Query => tracker.report_current(&self.sink).await,
        };
        if let Err(err) = result {
            warn!("Could not report {}: {}", tracker.state().name, err);
        }
    }

    /// Runs until `shutdown` resolves. Polls run inline, so a device is never
    /// polled again before its previous poll has returned.
    pub async fn run_loop(
        &mut self,
        mut requests: mpsc::Receiver<Request>,
        shutdown: impl Future<Output = ()>,
    ) {
        self.start().await;

        let mut short = tokio::time::interval(self.poll.short_interval());
        short.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first pulse already went out during start.
        let long_interval = self.poll.long_interval();
        let mut long = tokio::time::interval_at(Instant::now() + long_interval, long_interval);
        long.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = short.tick() => self.short_poll().await,
                _ = long.tick() => self.long_poll().await,
                Some(request) = requests.recv() => self.handle_request(request).await,
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.stop().await;
    }

    async fn publish_notices(&self) {
        if let Err(err) = self.sink.publish_notices(&self.notices).await {
            warn!("Could not publish notices: {}", err);
        }
    }

    async fn send(&self, report: Report) {
        if let Err(err) = self.sink.report(report).await {
            warn!("Could not publish report: {}", err);
        }
    }
}

fn notice_for(err: &Error) -> String {
    match err {
        Error::MissingParam(key) => format!(
            "Please set proper \"{key}\" key and value in [params] of the configuration, then restart"
        ),
        Error::InvalidParam { key, reason } => format!(
            "\"{key}\" in [params] is invalid ({reason}); correct it, then restart"
        ),
        other => other.to_string(),
    }
}

fn log_poll_failure(tracker: &PresenceTracker, err: &Error) {
    let name = &tracker.state().name;
    let failures = tracker.consecutive_failures();

    if err.is_auth_failure() {
        error!("Controller rejected credentials while polling {}: {}", name, err);
    } else if failures > 0 && failures % PERSISTENT_FAILURE_THRESHOLD == 0 {
        warn!("Polling {} has failed {} times in a row: {}", name, failures, err);
    } else if err.is_session_expired() {
        debug!("Session expired while polling {}, retrying next cycle", name);
    } else if err.is_transient() {
        info!("Skipping poll of {}: {}", name, err);
    } else {
        error!("Polling {} failed: {}", name, err);
    }
}
