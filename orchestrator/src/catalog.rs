// Copyright 2023 Oxide Computer Company

use spareway_common::{precondition_bail, Result};

/*
 * The observable transitions of a copy workflow.  The waiter derives a
 * predicate from live controller status for each of these; the catalog
 * below supplies the display name used in logging and timeout reports.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum EventType {
    SourceEdgeEol = 0,
    SwapIn,
    MirrorMode,
    MetadataRebuildStart,
    RebuildHook,
    CopyStart,
    CopyComplete,
    CopyCompleteInitiated,
    SwapOut,
    SwapOutComplete,
    SourceMarkedNr,
    ReinsertFailedDrives,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub event: EventType,
    pub name: &'static str,
}

const EVENTS: [EventInfo; 12] = [
    EventInfo {
        event: EventType::SourceEdgeEol,
        name: "source edge EOL",
    },
    EventInfo {
        event: EventType::SwapIn,
        name: "destination swap in",
    },
    EventInfo {
        event: EventType::MirrorMode,
        name: "mirror mode set",
    },
    EventInfo {
        event: EventType::MetadataRebuildStart,
        name: "metadata rebuild start",
    },
    EventInfo {
        event: EventType::RebuildHook,
        name: "rebuild hook hit",
    },
    EventInfo {
        event: EventType::CopyStart,
        name: "copy start",
    },
    EventInfo {
        event: EventType::CopyComplete,
        name: "copy complete",
    },
    EventInfo {
        event: EventType::CopyCompleteInitiated,
        name: "copy complete initiated",
    },
    EventInfo {
        event: EventType::SwapOut,
        name: "source swap out",
    },
    EventInfo {
        event: EventType::SwapOutComplete,
        name: "source swap out complete",
    },
    EventInfo {
        event: EventType::SourceMarkedNr,
        name: "source marked needs rebuild",
    },
    EventInfo {
        event: EventType::ReinsertFailedDrives,
        name: "failed drives reinserted",
    },
];

impl EventInfo {
    pub fn for_event(event: EventType) -> EventInfo {
        EVENTS[event as usize]
    }

    /// Lookup by raw ordinal, for callers that carry the event as a
    /// number.  An out-of-range ordinal is a caller bug.
    pub fn from_ordinal(ordinal: u32) -> Result<EventInfo> {
        let Some(ei) = EVENTS.get(ordinal as usize) else {
            precondition_bail!("event ordinal {} out of range", ordinal);
        };
        Ok(*ei)
    }
}

impl EventType {
    /// True for the events observed after the copy has completed and the
    /// object reverted to pass-through.  For these, the edge that used to
    /// be the destination is now the sole connected side, so source and
    /// destination roles evaluate inverted.
    pub fn flips_roles(&self) -> bool {
        matches!(
            self,
            EventType::CopyComplete
                | EventType::SwapOut
                | EventType::SwapOutComplete
        )
    }

    /// True when the wait only polls a hook hit counter, which uses the
    /// shorter poll interval.
    pub fn hook_paced(&self) -> bool {
        matches!(self, EventType::RebuildHook)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", EventInfo::for_event(*self).name)
    }
}
