use std::future::Future;

use mac_address::MacAddress;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Presence {
    OnNetwork,
    #[default]
    OffNetwork,
}

impl Presence {
    pub fn is_present(self) -> bool {
        self == Presence::OnNetwork
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Presence::OnNetwork => "on_network",
            Presence::OffNetwork => "off_network",
        }
    }
}

/// What a tracker knows about its device after its last successful poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceState {
    pub name: String,
    pub mac_address: MacAddress,
    pub presence: Presence,
    pub hostname: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    /// Emitted only when a poll changes a device's presence.
    StateChanged(DeviceState),
    /// Current state, emitted on request whether or not anything changed.
    Snapshot(DeviceState),
    Liveness(bool),
    ControllerStatus(/* online */ bool),
}

/// Controller-wide operator commands, received on
/// `{topic_path}/{publisher_id}/command/{name}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Discover,
    Query,
    UpdateProfile,
    RemoveNoticesAll,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Discover,
        Command::Query,
        Command::UpdateProfile,
        Command::RemoveNoticesAll,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Discover => "discover",
            Command::Query => "query",
            Command::UpdateProfile => "update_profile",
            Command::RemoveNoticesAll => "remove_notices_all",
        }
    }

    pub fn from_name(name: &str) -> Option<Command> {
        Command::ALL
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(name))
    }
}

/// Commands addressed to one device, received on
/// `{topic_path}/{publisher_id}/{device}/command/{name}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Force the device on-network until the next poll says otherwise.
    SetOn,
    SetOff,
    Query,
}

impl DeviceCommand {
    pub const ALL: [DeviceCommand; 3] = [
        DeviceCommand::SetOn,
        DeviceCommand::SetOff,
        DeviceCommand::Query,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceCommand::SetOn => "don",
            DeviceCommand::SetOff => "dof",
            DeviceCommand::Query => "query",
        }
    }

    pub fn from_name(name: &str) -> Option<DeviceCommand> {
        DeviceCommand::ALL
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(name))
    }
}

/// Anything an operator can ask for over the command topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Controller(Command),
    Device {
        /// Sanitized device name, as used in the device's topic.
        channel: String,
        command: DeviceCommand,
    },
}

impl Request {
    /// Parses a topic with the `{topic_path}/{publisher_id}/` prefix removed.
    pub fn from_topic(topic: &str) -> Option<Request> {
        if let Some(name) = topic.strip_prefix("command/") {
            return Command::from_name(name).map(Request::Controller);
        }

        let (channel, rest) = topic.split_once('/')?;
        let command = DeviceCommand::from_name(rest.strip_prefix("command/")?)?;
        Some(Request::Device {
            channel: channel.to_string(),
            command,
        })
    }
}

pub fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

/// Where presence reports, notices and the device profile end up.
pub trait ReportSink {
    fn report(&self, report: Report) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replaces the full set of outstanding operator notices.
    fn publish_notices(&self, notices: &[String]) -> impl Future<Output = Result<(), Error>> + Send;

    fn install_profile(&self) -> impl Future<Output = Result<(), Error>> + Send;
}
