//! The one application error this demo raises, showing how an entry-point
//! communicates a typed failure back across the privsep channel instead of
//! a bare string.

use privsep_core::RemoteError;
use rmpv::Value;

#[derive(Debug)]
pub struct QuotaExceeded {
    pub reason: String,
}

impl std::fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "quota exceeded: {}", self.reason)
    }
}

impl RemoteError for QuotaExceeded {
    const TYPE_IDENTIFIER: &'static str = "demos::errors::QuotaExceeded";

    fn to_args(&self) -> Vec<Value> {
        vec![Value::from(self.reason.as_str())]
    }

    fn render(args: &[Value]) -> String {
        let reason = args.first().and_then(|v| v.as_str()).unwrap_or("unknown");
        format!("quota exceeded: {reason}")
    }
}
