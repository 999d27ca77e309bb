//! Pre-open gap protection for overnight long positions.
//!
//! Compares today's open against the persisted entry reference. Only loss
//! gaps beyond `threshold + epsilon` trigger; profit gaps and near-zero
//! gaps never do.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapVerdict {
    Triggered,
    /// Threshold unset/non-positive or prices unusable.
    Disabled,
    /// Valid inputs, but the gap does not warrant protection.
    NotTriggered,
}

#[derive(Debug, Clone, Copy)]
pub struct GapDecision {
    pub verdict: GapVerdict,
    /// Signed raw gap percentage against the reference.
    pub raw_gap_pct: f64,
}

impl GapDecision {
    pub fn triggered(&self) -> bool {
        self.verdict == GapVerdict::Triggered
    }
}

pub fn evaluate_gap(
    open_price: f64,
    reference_price: f64,
    threshold_pct: Option<f64>,
    epsilon_pct: f64,
) -> GapDecision {
    let threshold = match threshold_pct {
        Some(t) if t > 0.0 => t,
        _ => {
            return GapDecision {
                verdict: GapVerdict::Disabled,
                raw_gap_pct: 0.0,
            }
        }
    };
    if open_price <= 0.0 || reference_price <= 0.0 {
        return GapDecision {
            verdict: GapVerdict::Disabled,
            raw_gap_pct: 0.0,
        };
    }

    let raw_gap_pct = (open_price - reference_price) / reference_price * 100.0;

    // Profit gaps never trigger.
    if raw_gap_pct > 0.0 {
        return GapDecision {
            verdict: GapVerdict::NotTriggered,
            raw_gap_pct,
        };
    }

    let epsilon = epsilon_pct.max(0.0);
    if raw_gap_pct <= -(threshold + epsilon) {
        GapDecision {
            verdict: GapVerdict::Triggered,
            raw_gap_pct,
        }
    } else {
        GapDecision {
            verdict: GapVerdict::NotTriggered,
            raw_gap_pct,
        }
    }
}
