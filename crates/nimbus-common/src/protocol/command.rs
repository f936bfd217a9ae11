use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::NimbusError;

/// The closed set of commands the nimbus server accepts.
///
/// Commands travel on the wire as their upper-snake token (e.g.
/// `START_INSTANCE`). Parsing anything outside this set yields a typed
/// [`NimbusError::UnknownCommand`], which the server turns into a status-1
/// result rather than a crash.
///
/// # Example
///
/// ```
/// use nimbus_common::Command;
///
/// let cmd: Command = "QUERY_REGION".parse().unwrap();
/// assert_eq!(cmd, Command::QueryRegion);
/// assert_eq!(cmd.as_str(), "QUERY_REGION");
///
/// assert!("FOO".parse::<Command>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Re-query one region's instances from the provider.
    QueryRegion,
    /// Start an instance and wait for it to reach "running".
    StartInstance,
    /// Stop an instance without waiting for it to settle.
    StopInstance,
    /// Attach an existing network interface to an instance.
    ConnectEni,
    /// Create interfaces in an existing subnet (accepted, currently a no-op).
    CreateEnis,
    /// Create a subnet with a collision-avoiding name plus interfaces in it.
    CreateEniAndSubnet,
    /// Detach every non-primary interface from an instance.
    DetachAllEnis,
    /// Return the cached record for one region, without a provider call.
    GetCurrentRegionState,
    /// Return every cached region record.
    GetCurrentCompleteState,
}

impl Command {
    /// The wire token for this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::QueryRegion => "QUERY_REGION",
            Command::StartInstance => "START_INSTANCE",
            Command::StopInstance => "STOP_INSTANCE",
            Command::ConnectEni => "CONNECT_ENI",
            Command::CreateEnis => "CREATE_ENIS",
            Command::CreateEniAndSubnet => "CREATE_ENI_AND_SUBNET",
            Command::DetachAllEnis => "DETACH_ALL_ENIS",
            Command::GetCurrentRegionState => "GET_CURRENT_REGION_STATE",
            Command::GetCurrentCompleteState => "GET_CURRENT_COMPLETE_STATE",
        }
    }
}

impl FromStr for Command {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUERY_REGION" => Ok(Command::QueryRegion),
            "START_INSTANCE" => Ok(Command::StartInstance),
            "STOP_INSTANCE" => Ok(Command::StopInstance),
            "CONNECT_ENI" => Ok(Command::ConnectEni),
            "CREATE_ENIS" => Ok(Command::CreateEnis),
            "CREATE_ENI_AND_SUBNET" => Ok(Command::CreateEniAndSubnet),
            "DETACH_ALL_ENIS" => Ok(Command::DetachAllEnis),
            "GET_CURRENT_REGION_STATE" => Ok(Command::GetCurrentRegionState),
            "GET_CURRENT_COMPLETE_STATE" => Ok(Command::GetCurrentCompleteState),
            other => Err(NimbusError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
