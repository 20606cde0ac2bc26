//! Resumable upload state machine.
//!
//! The driver owns all I/O; this module only decides what to do next and
//! whether a server answer is acceptable. Offsets held here are always values
//! the server reported, so reaching [`TusState::Completed`] implies the server
//! acknowledged `offset == length`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TusLimits {
    pub chunk_size: u64,
    pub server_max_chunk: Option<u64>,
    pub max_retries: u32,
}

impl TusLimits {
    fn chunk_len(&self, remaining: u64) -> u64 {
        let mut len = self.chunk_size.min(remaining);
        if let Some(cap) = self.server_max_chunk.filter(|c| *c > 0) {
            len = len.min(cap);
        }
        len.max(1).min(remaining)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub offset: u64,
    pub length: u64,
    /// Consecutive attempts that made no progress.
    pub failures: u32,
}

impl Cursor {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TusState {
    NoSession { length: u64 },
    /// Session persisted; the server offset has not been queried yet.
    Created(Cursor),
    Uploading(Cursor),
    /// A PATCH failed; the offset must be re-queried.
    Recovering(Cursor),
    /// Waiting before the same chunk is sent again.
    BackingOff(Cursor),
    Completed { length: u64 },
}

impl TusState {
    /// Entry state for a record with a stored session.
    pub fn resume(offset: u64, length: u64) -> Self {
        TusState::Created(Cursor::new(offset, length))
    }

    pub fn offset(&self) -> u64 {
        match self {
            TusState::NoSession { .. } => 0,
            TusState::Created(c)
            | TusState::Uploading(c)
            | TusState::Recovering(c)
            | TusState::BackingOff(c) => c.offset,
            TusState::Completed { length } => *length,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            TusState::NoSession { length } | TusState::Completed { length } => *length,
            TusState::Created(c)
            | TusState::Uploading(c)
            | TusState::Recovering(c)
            | TusState::BackingOff(c) => c.length,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TusState::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TusEvent {
    /// Creation succeeded. `offset` is non-zero when bytes were sent inline.
    SessionCreated { offset: u64 },
    OffsetResolved(u64),
    /// The offset query failed transiently.
    OffsetUnavailable,
    PatchAcknowledged(u64),
    PatchFailed,
    BackoffElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TusAction {
    Create,
    QueryOffset,
    Patch { offset: u64, len: u64 },
    Backoff { attempt: u32 },
    Finish,
}

/// How the persisted offset must change after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetChange {
    Unchanged,
    Advanced(u64),
    /// The server reports fewer bytes than were persisted.
    Rewound(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TusViolation {
    #[error("server offset went backwards from {previous} to {reported}")]
    OffsetRegressed { previous: u64, reported: u64 },
    #[error("server offset {reported} exceeds upload length {length}")]
    OffsetBeyondLength { reported: u64, length: u64 },
    #[error("no progress at offset {offset} after {attempts} attempts")]
    RetriesExhausted { offset: u64, attempts: u32 },
    #[error("event {event:?} is not valid in state {state}")]
    UnexpectedEvent { state: &'static str, event: TusEvent },
}

impl fmt::Display for TusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TusState {
    fn name(&self) -> &'static str {
        match self {
            TusState::NoSession { .. } => "NoSession",
            TusState::Created(_) => "Created",
            TusState::Uploading(_) => "Uploading",
            TusState::Recovering(_) => "Recovering",
            TusState::BackingOff(_) => "BackingOff",
            TusState::Completed { .. } => "Completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub state: TusState,
    pub offset: OffsetChange,
}

pub struct TusMachine;

impl TusMachine {
    pub fn next_action(state: &TusState, limits: &TusLimits) -> TusAction {
        match state {
            TusState::NoSession { .. } => TusAction::Create,
            TusState::Created(_) | TusState::Recovering(_) => TusAction::QueryOffset,
            TusState::Uploading(c) => TusAction::Patch {
                offset: c.offset,
                len: limits.chunk_len(c.length - c.offset),
            },
            TusState::BackingOff(c) => TusAction::Backoff {
                attempt: c.failures,
            },
            TusState::Completed { .. } => TusAction::Finish,
        }
    }

    pub fn apply(state: TusState, event: TusEvent, limits: &TusLimits) -> Result<Step, TusViolation> {
        let unexpected = || TusViolation::UnexpectedEvent {
            state: state.name(),
            event,
        };

        match (state, event) {
            (TusState::NoSession { length }, TusEvent::SessionCreated { offset }) => {
                check_bounds(offset, length)?;
                let next = if offset == length {
                    TusState::Completed { length }
                } else {
                    TusState::Created(Cursor::new(offset, length))
                };
                Ok(Step {
                    state: next,
                    offset: OffsetChange::Unchanged,
                })
            }

            (TusState::Created(c), TusEvent::OffsetResolved(reported)) => {
                check_bounds(reported, c.length)?;
                let change = compare(c.offset, reported);
                let next = if reported == c.length {
                    TusState::Completed { length: c.length }
                } else {
                    TusState::Uploading(Cursor::new(reported, c.length))
                };
                Ok(Step {
                    state: next,
                    offset: change,
                })
            }
            (TusState::Created(c), TusEvent::OffsetUnavailable) => Ok(Step {
                state: TusState::Uploading(c),
                offset: OffsetChange::Unchanged,
            }),

            (TusState::Uploading(c), TusEvent::PatchAcknowledged(reported)) => {
                if reported < c.offset {
                    return Err(TusViolation::OffsetRegressed {
                        previous: c.offset,
                        reported,
                    });
                }
                check_bounds(reported, c.length)?;
                if reported == c.length {
                    return Ok(Step {
                        state: TusState::Completed { length: c.length },
                        offset: OffsetChange::Advanced(reported),
                    });
                }
                if reported == c.offset {
                    return Ok(Step {
                        state: TusState::BackingOff(count_failure(c, limits)?),
                        offset: OffsetChange::Unchanged,
                    });
                }
                Ok(Step {
                    state: TusState::Uploading(Cursor::new(reported, c.length)),
                    offset: OffsetChange::Advanced(reported),
                })
            }
            (TusState::Uploading(c), TusEvent::PatchFailed) => Ok(Step {
                state: TusState::Recovering(c),
                offset: OffsetChange::Unchanged,
            }),

            (TusState::Recovering(c), TusEvent::OffsetResolved(reported)) => {
                check_bounds(reported, c.length)?;
                if reported == c.length {
                    return Ok(Step {
                        state: TusState::Completed { length: c.length },
                        offset: OffsetChange::Advanced(reported),
                    });
                }
                if reported > c.offset {
                    // The failed PATCH was partially applied server-side.
                    return Ok(Step {
                        state: TusState::Uploading(Cursor::new(reported, c.length)),
                        offset: OffsetChange::Advanced(reported),
                    });
                }
                if reported < c.offset {
                    let counted = count_failure(c, limits)?;
                    return Ok(Step {
                        state: TusState::Uploading(Cursor {
                            offset: reported,
                            ..counted
                        }),
                        offset: OffsetChange::Rewound(reported),
                    });
                }
                Ok(Step {
                    state: TusState::BackingOff(count_failure(c, limits)?),
                    offset: OffsetChange::Unchanged,
                })
            }
            (TusState::Recovering(c), TusEvent::OffsetUnavailable) => Ok(Step {
                state: TusState::BackingOff(count_failure(c, limits)?),
                offset: OffsetChange::Unchanged,
            }),

            (TusState::BackingOff(c), TusEvent::BackoffElapsed) => Ok(Step {
                state: TusState::Uploading(c),
                offset: OffsetChange::Unchanged,
            }),

            _ => Err(unexpected()),
        }
    }
}

fn check_bounds(reported: u64, length: u64) -> Result<(), TusViolation> {
    if reported > length {
        return Err(TusViolation::OffsetBeyondLength { reported, length });
    }
    Ok(())
}

fn compare(persisted: u64, reported: u64) -> OffsetChange {
    use std::cmp::Ordering;
    match reported.cmp(&persisted) {
        Ordering::Greater => OffsetChange::Advanced(reported),
        Ordering::Less => OffsetChange::Rewound(reported),
        Ordering::Equal => OffsetChange::Unchanged,
    }
}

fn count_failure(c: Cursor, limits: &TusLimits) -> Result<Cursor, TusViolation> {
    let failures = c.failures + 1;
    if failures > limits.max_retries {
        return Err(TusViolation::RetriesExhausted {
            offset: c.offset,
            attempts: failures,
        });
    }
    Ok(Cursor { failures, ..c })
}
