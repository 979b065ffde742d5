use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Lifecycle status of a run. The declaration order is the only order in
/// which statuses may be recorded; `Ord` follows it.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Sequencing,
    ReadyToDemux,
    Demultiplexing,
    DemuxComplete,
    Transferring,
    Transferred,
    Archived,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Sequencing,
        RunStatus::ReadyToDemux,
        RunStatus::Demultiplexing,
        RunStatus::DemuxComplete,
        RunStatus::Transferring,
        RunStatus::Transferred,
        RunStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Sequencing => "SEQUENCING",
            RunStatus::ReadyToDemux => "READY_TO_DEMUX",
            RunStatus::Demultiplexing => "DEMULTIPLEXING",
            RunStatus::DemuxComplete => "DEMUX_COMPLETE",
            RunStatus::Transferring => "TRANSFERRING",
            RunStatus::Transferred => "TRANSFERRED",
            RunStatus::Archived => "ARCHIVED",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<RunStatus> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown run status '{s}'"))
    }
}

/// Progress of the external demultiplexing tool, derived from its output.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum DemuxStatus {
    NotStarted,
    Ongoing,
    Finished,
}

impl Display for DemuxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DemuxStatus::NotStarted => "not started",
            DemuxStatus::Ongoing => "ongoing",
            DemuxStatus::Finished => "finished",
        })
    }
}
