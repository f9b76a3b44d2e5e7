//! Closed error-code taxonomy shared between the pipeline, the HTTP API and
//! external stage binaries.
//!
//! Codes are grouped by subsystem: 1xxx scraping, 2xxx processing, 3xxx
//! orchestration, 9xxx system. Each code carries a static title, a recovery
//! hint, and whether a retry is worth offering.

/// A protocol-visible error code.
///
/// On the wire this always appears as its `ERR_nnnn` string, never as a
/// variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ScrapingTimeout,
    ScrapingNoData,
    AuthFailed,
    InvalidDate,
    InvalidFile,
    NoColumns,
    ParseFailed,
    PipelineBusy,
    StageTimeout,
    StageExit,
    Cancelled,
    OutOfMemory,
    DiskFull,
    FileAccess,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScrapingTimeout => "ERR_1001",
            Self::ScrapingNoData => "ERR_1002",
            Self::AuthFailed => "ERR_1003",
            Self::InvalidDate => "ERR_1004",
            Self::InvalidFile => "ERR_2001",
            Self::NoColumns => "ERR_2002",
            Self::ParseFailed => "ERR_2003",
            Self::PipelineBusy => "ERR_3001",
            Self::StageTimeout => "ERR_3002",
            Self::StageExit => "ERR_3003",
            Self::Cancelled => "ERR_3004",
            Self::OutOfMemory => "ERR_9001",
            Self::DiskFull => "ERR_9002",
            Self::FileAccess => "ERR_9003",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ERR_1001" => Some(Self::ScrapingTimeout),
            "ERR_1002" => Some(Self::ScrapingNoData),
            "ERR_1003" => Some(Self::AuthFailed),
            "ERR_1004" => Some(Self::InvalidDate),
            "ERR_2001" => Some(Self::InvalidFile),
            "ERR_2002" => Some(Self::NoColumns),
            "ERR_2003" => Some(Self::ParseFailed),
            "ERR_3001" => Some(Self::PipelineBusy),
            "ERR_3002" => Some(Self::StageTimeout),
            "ERR_3003" => Some(Self::StageExit),
            "ERR_3004" => Some(Self::Cancelled),
            "ERR_9001" => Some(Self::OutOfMemory),
            "ERR_9002" => Some(Self::DiskFull),
            "ERR_9003" => Some(Self::FileAccess),
            _ => None,
        }
    }

    /// Short human-readable title.
    pub fn title(&self) -> &'static str {
        match self {
            Self::ScrapingTimeout => "Scraping Timeout",
            Self::ScrapingNoData => "No Data Found",
            Self::AuthFailed => "Authentication Failed",
            Self::InvalidDate => "Invalid Date Range",
            Self::InvalidFile => "Invalid File",
            Self::NoColumns => "No Columns Recognized",
            Self::ParseFailed => "Parse Failed",
            Self::PipelineBusy => "Pipeline Busy",
            Self::StageTimeout => "Stage Timeout",
            Self::StageExit => "Stage Exited Abnormally",
            Self::Cancelled => "Pipeline Cancelled",
            Self::OutOfMemory => "Out of Memory",
            Self::DiskFull => "Disk Full",
            Self::FileAccess => "File Access Denied",
        }
    }

    /// One-line recovery hint shown next to the error.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::ScrapingTimeout => "The exchange site was slow to respond. Retry the same date range.",
            Self::ScrapingNoData => "No reports were published for the requested dates. Try a wider range.",
            Self::AuthFailed => "Site login was rejected. Check credentials in the configuration, then inspect the logs.",
            Self::InvalidDate => "Dates must be YYYY-MM-DD with from <= to.",
            Self::InvalidFile => "A downloaded report could not be opened. Delete it and re-run scraping.",
            Self::NoColumns => "The report layout was not recognized. The exchange may have changed its format; inspect the logs.",
            Self::ParseFailed => "A report failed to parse. Inspect the logs for the offending file.",
            Self::PipelineBusy => "Another pipeline is already running. Wait for it to finish or stop it first.",
            Self::StageTimeout => "The stage exceeded its deadline. Retry; if it persists, inspect the logs.",
            Self::StageExit => "The stage process exited with an error. Inspect the logs for its output.",
            Self::Cancelled => "The pipeline was cancelled on request.",
            Self::OutOfMemory => "The system ran out of memory. Close other applications and retry.",
            Self::DiskFull => "No space left on the data disk. Free space and retry.",
            Self::FileAccess => "A data file could not be read or written. Check permissions on the data directory.",
        }
    }

    /// Whether the user can retry without intervention.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScrapingTimeout | Self::ScrapingNoData | Self::StageTimeout
        )
    }

    /// HTTP status for API responses carrying this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidDate => 400,
            Self::PipelineBusy => 409,
            Self::StageTimeout => 504,
            _ => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
