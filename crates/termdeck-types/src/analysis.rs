//! Per-chunk output classification.

use serde::Serialize;

/// Result of matching one cleaned chunk of terminal text against a tool
/// dialect's status-line patterns.
///
/// Transient value, produced per chunk and never persisted. `None` from an
/// analyzer means "no update": the caller must leave prior state unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// Tool is actively working.
    pub is_processing: bool,
    /// The user cancelled the current request. Always wins over processing.
    pub is_interrupted: bool,
    /// Tool is waiting for a user confirmation.
    pub is_waiting_for_user: bool,
    /// The dialect rendered an explicit completion marker.
    pub is_complete: bool,
    /// Elapsed seconds from the status line, where the dialect exposes it.
    pub elapsed_seconds: Option<u64>,
    /// Human-readable activity description (e.g. "Concocting").
    pub status_text: Option<String>,
    /// Throughput direction indicator from the status line ("↓" or "↑").
    pub direction: Option<String>,
    /// Token figure from the status line, kept verbatim (e.g. "100", "1.2k").
    pub token_figure: Option<String>,
}

impl AnalysisResult {
    /// A bare processing classification with no captured detail.
    pub fn processing() -> Self {
        Self {
            is_processing: true,
            ..Default::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            is_interrupted: true,
            ..Default::default()
        }
    }

    pub fn waiting_for_user() -> Self {
        Self {
            is_waiting_for_user: true,
            ..Default::default()
        }
    }

    pub fn complete(elapsed_seconds: Option<u64>) -> Self {
        Self {
            is_complete: true,
            elapsed_seconds,
            ..Default::default()
        }
    }
}
