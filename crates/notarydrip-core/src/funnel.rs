//! Funnel status guard: the monotonic ordering over a subject's lifecycle stage.
//!
//! A subject's status only ever moves forward. Every status write and every
//! status-gated send goes through the comparisons in this module.

use serde::{Deserialize, Serialize};

/// A subject's lifecycle stage, in funnel order.
///
/// Unrecognised strings deserialize to [`FunnelStatus::Unknown`], which ranks
/// below every known status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStatus {
    Started,
    ServicesSelected,
    DocumentsUploaded,
    DeliveryMethodSelected,
    PersonalInfoCompleted,
    SummaryViewed,
    PaymentPending,
    PaymentCompleted,
    SubmissionCompleted,
    #[serde(other)]
    Unknown,
}

impl FunnelStatus {
    /// Every known status, lowest first.
    pub const ALL: [FunnelStatus; 9] = [
        FunnelStatus::Started,
        FunnelStatus::ServicesSelected,
        FunnelStatus::DocumentsUploaded,
        FunnelStatus::DeliveryMethodSelected,
        FunnelStatus::PersonalInfoCompleted,
        FunnelStatus::SummaryViewed,
        FunnelStatus::PaymentPending,
        FunnelStatus::PaymentCompleted,
        FunnelStatus::SubmissionCompleted,
    ];

    /// Position in the funnel. `Unknown` is 0, `Started` is 1.
    pub fn order(&self) -> u8 {
        match self {
            FunnelStatus::Unknown => 0,
            FunnelStatus::Started => 1,
            FunnelStatus::ServicesSelected => 2,
            FunnelStatus::DocumentsUploaded => 3,
            FunnelStatus::DeliveryMethodSelected => 4,
            FunnelStatus::PersonalInfoCompleted => 5,
            FunnelStatus::SummaryViewed => 6,
            FunnelStatus::PaymentPending => 7,
            FunnelStatus::PaymentCompleted => 8,
            FunnelStatus::SubmissionCompleted => 9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStatus::Started => "started",
            FunnelStatus::ServicesSelected => "services_selected",
            FunnelStatus::DocumentsUploaded => "documents_uploaded",
            FunnelStatus::DeliveryMethodSelected => "delivery_method_selected",
            FunnelStatus::PersonalInfoCompleted => "personal_info_completed",
            FunnelStatus::SummaryViewed => "summary_viewed",
            FunnelStatus::PaymentPending => "payment_pending",
            FunnelStatus::PaymentCompleted => "payment_completed",
            FunnelStatus::SubmissionCompleted => "submission_completed",
            FunnelStatus::Unknown => "unknown",
        }
    }

    /// Lenient parse: anything unrecognised becomes `Unknown`.
    pub fn parse(s: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s.trim())
            .unwrap_or(FunnelStatus::Unknown)
    }
}

impl std::fmt::Display for FunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True iff `proposed` is strictly further down the funnel than `current`.
pub fn should_advance(current: FunnelStatus, proposed: FunnelStatus) -> bool {
    proposed.order() > current.order()
}

/// The further-along of two statuses. Ties favour `a`.
pub fn higher_of(a: FunnelStatus, b: FunnelStatus) -> FunnelStatus {
    if b.order() > a.order() { b } else { a }
}

/// How a sequence's required status is compared with a subject's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusGate {
    /// The subject must be exactly at the required status. Once it advances
    /// past it, remaining sends are skipped.
    #[default]
    Exact,
    /// The subject must have reached the required status (at or beyond it).
    AtLeast,
}

impl StatusGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusGate::Exact => "exact",
            StatusGate::AtLeast => "at_least",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "at_least" => StatusGate::AtLeast,
            _ => StatusGate::Exact,
        }
    }

    /// Whether a subject currently at `current` satisfies `required`.
    pub fn admits(&self, required: FunnelStatus, current: FunnelStatus) -> bool {
        match self {
            StatusGate::Exact => current == required,
            StatusGate::AtLeast => current.order() >= required.order(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_status_never_advances() {
        for s in FunnelStatus::ALL {
            assert!(!should_advance(s, s), "{s} -> {s}");
        }
        assert!(!should_advance(FunnelStatus::Unknown, FunnelStatus::Unknown));
    }

    #[test]
    fn test_all_pairs_follow_order() {
        for (i, a) in FunnelStatus::ALL.iter().enumerate() {
            for (j, b) in FunnelStatus::ALL.iter().enumerate() {
                assert_eq!(should_advance(*a, *b), j > i, "{a} -> {b}");
            }
        }
    }

    #[test]
    fn test_unknown_ranks_lowest() {
        assert_eq!(FunnelStatus::parse("abandoned"), FunnelStatus::Unknown);
        assert!(should_advance(FunnelStatus::Unknown, FunnelStatus::Started));
        assert!(!should_advance(FunnelStatus::Started, FunnelStatus::Unknown));
    }

    #[test]
    fn test_higher_of_ties_favour_first() {
        assert_eq!(
            higher_of(FunnelStatus::PaymentPending, FunnelStatus::Started),
            FunnelStatus::PaymentPending
        );
        assert_eq!(
            higher_of(FunnelStatus::Started, FunnelStatus::SummaryViewed),
            FunnelStatus::SummaryViewed
        );
        // Unknown and Unknown tie; `a` wins (they are equal anyway).
        assert_eq!(
            higher_of(FunnelStatus::Unknown, FunnelStatus::Unknown),
            FunnelStatus::Unknown
        );
    }

    #[test]
    fn test_serde_round_names() {
        let s: FunnelStatus = serde_json::from_str("\"delivery_method_selected\"").unwrap();
        assert_eq!(s, FunnelStatus::DeliveryMethodSelected);
        let unknown: FunnelStatus = serde_json::from_str("\"refunded\"").unwrap();
        assert_eq!(unknown, FunnelStatus::Unknown);
        assert_eq!(FunnelStatus::parse(" payment_pending "), FunnelStatus::PaymentPending);
    }

    #[test]
    fn test_gate_modes() {
        let req = FunnelStatus::DocumentsUploaded;
        assert!(StatusGate::Exact.admits(req, FunnelStatus::DocumentsUploaded));
        assert!(!StatusGate::Exact.admits(req, FunnelStatus::PaymentCompleted));
        assert!(!StatusGate::Exact.admits(req, FunnelStatus::Started));

        assert!(StatusGate::AtLeast.admits(req, FunnelStatus::DocumentsUploaded));
        assert!(StatusGate::AtLeast.admits(req, FunnelStatus::PaymentCompleted));
        assert!(!StatusGate::AtLeast.admits(req, FunnelStatus::ServicesSelected));
    }
}
