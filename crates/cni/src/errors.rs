use core::error::Error;

use error_stack::AttachmentKind;
use error_stack::FrameKind;
use error_stack::Report;

/// CNI failures, each mapping onto a protocol error code.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum CniError {
    #[display("incompatible CNI version {version:?}")]
    IncompatibleVersion { version: String },
    #[display("invalid environment: {message}")]
    InvalidEnvironment { message: String },
    #[display("failed to decode {what}")]
    Decoding { what: String },
    #[display("invalid network config: {message}")]
    InvalidConfig { message: String },
    #[display("failed to lookup device {name:?}: Link not found")]
    LinkNotFound { name: String },
    #[display("{message}")]
    Plugin { message: String },
    #[display("IPAM plugin {plugin} failed")]
    Ipam { plugin: String },
    #[display("failed to {operation}")]
    LinkOperation { operation: String },
}

impl Error for CniError {}

impl CniError {
    /// Code reported in the error result.
    pub fn code(&self) -> u32 {
        match self {
            CniError::IncompatibleVersion { .. } => 1,
            CniError::InvalidEnvironment { .. } => 4,
            CniError::Decoding { .. } => 6,
            CniError::InvalidConfig { .. } => 7,
            CniError::LinkNotFound { .. } => 11,
            CniError::Plugin { .. } => 100,
            CniError::Ipam { .. } => 101,
            CniError::LinkOperation { .. } => 102,
        }
    }

    pub fn link_operation(operation: impl Into<String>) -> Self {
        CniError::LinkOperation {
            operation: operation.into(),
        }
    }
}

/// Everything below the top context of `report`, outermost first, joined by `": "`.
pub fn details<C>(report: &Report<C>) -> String {
    let mut top = true;
    report
        .frames()
        .filter_map(|frame| match frame.kind() {
            FrameKind::Context(_) if top => {
                top = false;
                None
            }
            FrameKind::Context(context) => Some(context.to_string()),
            FrameKind::Attachment(AttachmentKind::Printable(printable)) => {
                Some(printable.to_string())
            }
            FrameKind::Attachment(_) => None,
        })
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use error_stack::ResultExt;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn details_follow_the_chain() {
        let io: Result<(), _> = Err(std::io::Error::other("boom"));
        let report = io
            .attach_printable("while reading stdin")
            .change_context(CniError::Decoding {
                what: "network config".to_string(),
            })
            .expect_err("failed");

        assert_eq!(report.current_context().code(), 6);
        assert_eq!(
            report.current_context().to_string(),
            "failed to decode network config"
        );
        assert_eq!(details(&report), "while reading stdin: boom");
    }

    #[test]
    fn details_keep_attachments_of_the_top_context() {
        let report = Report::new(CniError::Ipam {
            plugin: "host-local".to_string(),
        })
        .attach_printable("code 11: no addresses left");

        assert_eq!(details(&report), "code 11: no addresses left");
    }
}
