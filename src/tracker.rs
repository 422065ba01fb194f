use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use mac_address::MacAddress;

use crate::config::{Credentials, DeviceEntry};
use crate::error::Error;
use crate::messages::{DeviceState, Presence, Report, ReportSink};
use crate::unifi::{ClientFilter, ClientRecord, UnifiClient, format_mac};

/// Owns one device's last known presence and refreshes it from the controller.
pub struct PresenceTracker {
    state: DeviceState,
    credentials: Arc<Credentials>,
    timeout: Duration,
    consecutive_failures: u32,
}

impl PresenceTracker {
    pub fn new(entry: DeviceEntry, credentials: Arc<Credentials>, timeout: Duration) -> Self {
        PresenceTracker {
            state: DeviceState {
                name: entry.name,
                mac_address: entry.address,
                presence: Presence::OffNetwork,
                hostname: None,
            },
            credentials,
            timeout,
            consecutive_failures: 0,
        }
    }

    pub fn address(&self) -> MacAddress {
        self.state.mac_address
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Number of polls in a row that ended in an error.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Runs one login → lookup → logout cycle and reports a transition if
    /// the device's presence changed. A failed poll leaves the stored state
    /// untouched.
    pub async fn update<S: ReportSink>(&mut self, sink: &S) -> Result<Presence, Error> {
        let records = match tokio::time::timeout(self.timeout, self.fetch()).await {
            Ok(Ok(records)) => {
                self.consecutive_failures = 0;
                records
            }
            Ok(Err(err)) => {
                self.consecutive_failures += 1;
                return Err(err);
            }
            Err(_) => {
                self.consecutive_failures += 1;
                return Err(Error::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let mac = format_mac(self.state.mac_address);
        let record = records.iter().find(|record| record.mac == mac);
        // No record means the device cannot be confirmed present.
        let presence = match record {
            Some(record) if record.is_associated() => Presence::OnNetwork,
            _ => Presence::OffNetwork,
        };
        if let Some(hostname) = record.and_then(|record| record.hostname.clone()) {
            self.state.hostname = Some(hostname);
        }

        if presence == self.state.presence {
            debug!("{} still {}", self.state.name, presence.as_str());
            return Ok(presence);
        }

        info!(
            "{} ({}) is now {}",
            self.state.name,
            mac,
            presence.as_str()
        );
        self.transition(presence, sink).await?;
        Ok(presence)
    }

    /// Operator override. The next poll replaces it with what the controller says.
    pub async fn set_presence<S: ReportSink>(
        &mut self,
        presence: Presence,
        sink: &S,
    ) -> Result<(), Error> {
        if presence == self.state.presence {
            return Ok(());
        }
        info!("{} set to {} by operator", self.state.name, presence.as_str());
        self.transition(presence, sink).await
    }

    // The new presence is only stored once the sink has taken it, so a
    // failed report is retried on the next poll.
    async fn transition<S: ReportSink>(&mut self, presence: Presence, sink: &S) -> Result<(), Error> {
        let mut next = self.state.clone();
        next.presence = presence;
        sink.report(Report::StateChanged(next)).await?;
        self.state.presence = presence;
        Ok(())
    }

    /// Emits the stored state regardless of whether it changed.
    pub async fn report_current<S: ReportSink>(&self, sink: &S) -> Result<(), Error> {
        sink.report(Report::Snapshot(self.state.clone())).await
    }

    async fn fetch(&self) -> Result<Vec<ClientRecord>, Error> {
        let session = UnifiClient::new(self.credentials.clone(), self.timeout)?
            .login()
            .await?;
        let records = session
            .list_clients(&ClientFilter::mac(self.state.mac_address))
            .await;
        if let Err(err) = session.logout().await {
            debug!("Logout for {} failed: {}", self.state.name, err);
        }
        records
    }
}
