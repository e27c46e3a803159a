use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Observable state of `/domains/<uuid>/state`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Start,
    Restart,
    Shutdown,
    Stop,
    Disable,
    Migrate,
    Unmigrate,
    Provision,
    Fail,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DomainState::Start => "start",
            DomainState::Restart => "restart",
            DomainState::Shutdown => "shutdown",
            DomainState::Stop => "stop",
            DomainState::Disable => "disable",
            DomainState::Migrate => "migrate",
            DomainState::Unmigrate => "unmigrate",
            DomainState::Provision => "provision",
            DomainState::Fail => "fail",
        })
    }
}

impl FromStr for DomainState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start" => DomainState::Start,
            "restart" => DomainState::Restart,
            "shutdown" => DomainState::Shutdown,
            "stop" => DomainState::Stop,
            "disable" => DomainState::Disable,
            "migrate" => DomainState::Migrate,
            "unmigrate" => DomainState::Unmigrate,
            "provision" => DomainState::Provision,
            "fail" => DomainState::Fail,
            other => return Err(CodecError::invalid("domain_state", other)),
        })
    }
}

/// `/nodes/<name>/daemon_state`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Init,
    Run,
    Stop,
    Dead,
    Fenced,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DaemonState::Init => "init",
            DaemonState::Run => "run",
            DaemonState::Stop => "stop",
            DaemonState::Dead => "dead",
            DaemonState::Fenced => "fenced",
        })
    }
}

impl FromStr for DaemonState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "init" => DaemonState::Init,
            "run" => DaemonState::Run,
            "stop" => DaemonState::Stop,
            "dead" => DaemonState::Dead,
            "fenced" => DaemonState::Fenced,
            other => return Err(CodecError::invalid("daemon_state", other)),
        })
    }
}

/// `/nodes/<name>/domain_state`: the node's own flush lifecycle, distinct
/// from the per-VM `DomainState`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDomainState {
    Ready,
    Flush,
    Flushed,
}

impl fmt::Display for NodeDomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeDomainState::Ready => "ready",
            NodeDomainState::Flush => "flush",
            NodeDomainState::Flushed => "flushed",
        })
    }
}

impl FromStr for NodeDomainState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ready" => NodeDomainState::Ready,
            "flush" => NodeDomainState::Flush,
            "flushed" => NodeDomainState::Flushed,
            other => return Err(CodecError::invalid("domain_state", other)),
        })
    }
}

/// `/nodes/<name>/router_state`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    Primary,
    Secondary,
    Takeover,
    Relinquish,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouterState::Primary => "primary",
            RouterState::Secondary => "secondary",
            RouterState::Takeover => "takeover",
            RouterState::Relinquish => "relinquish",
        })
    }
}

impl FromStr for RouterState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "primary" => RouterState::Primary,
            "secondary" => RouterState::Secondary,
            "takeover" => RouterState::Takeover,
            "relinquish" => RouterState::Relinquish,
            other => return Err(CodecError::invalid("router_state", other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_state_round_trips() {
        for state in [
            DomainState::Start,
            DomainState::Restart,
            DomainState::Shutdown,
            DomainState::Stop,
            DomainState::Disable,
            DomainState::Migrate,
            DomainState::Unmigrate,
            DomainState::Provision,
            DomainState::Fail,
        ] {
            let parsed: DomainState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn rejects_unknown_daemon_state() {
        assert!("zombified".parse::<DaemonState>().is_err());
    }
}
