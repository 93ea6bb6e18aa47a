//! MEGA API error codes.

use stowage_common::Error;

/// Internal server error; retry.
pub const EINTERNAL: i64 = -1;
pub const EARGS: i64 = -2;
/// Request failed, retry with backoff.
pub const EAGAIN: i64 = -3;
pub const ERATELIMIT: i64 = -4;
pub const EFAILED: i64 = -5;
pub const ETOOMANY: i64 = -6;
pub const ERANGE: i64 = -7;
pub const EEXPIRED: i64 = -8;
pub const ENOENT: i64 = -9;
pub const ECIRCULAR: i64 = -10;
pub const EACCESS: i64 = -11;
pub const EEXIST: i64 = -12;
pub const EINCOMPLETE: i64 = -13;
pub const EKEY: i64 = -14;
/// Invalid or expired session.
pub const ESID: i64 = -15;
pub const EBLOCKED: i64 = -16;
pub const EOVERQUOTA: i64 = -17;
pub const ETEMPUNAVAIL: i64 = -18;
pub const ETOOMANYCONNECTIONS: i64 = -19;
pub const EWRITE: i64 = -20;
pub const EREAD: i64 = -21;
pub const EAPPKEY: i64 = -22;
pub const ESSL: i64 = -23;
pub const EGOINGOVERQUOTA: i64 = -24;
pub const EMFAREQUIRED: i64 = -26;

fn describe(code: i64) -> &'static str {
    match code {
        EINTERNAL => "internal error",
        EARGS => "invalid arguments",
        EAGAIN => "request failed, retry",
        ERATELIMIT => "rate limited",
        EFAILED => "upload failed",
        ETOOMANY => "too many concurrent requests",
        ERANGE => "resource access out of range",
        EEXPIRED => "resource expired",
        ENOENT => "resource does not exist",
        ECIRCULAR => "circular linkage",
        EACCESS => "access denied",
        EEXIST => "resource already exists",
        EINCOMPLETE => "request incomplete",
        EKEY => "cryptographic error",
        ESID => "bad session id",
        EBLOCKED => "resource administratively blocked",
        EOVERQUOTA => "quota exceeded",
        ETEMPUNAVAIL => "resource temporarily unavailable",
        ETOOMANYCONNECTIONS => "too many connections",
        EWRITE => "write failed",
        EREAD => "read failed",
        EAPPKEY => "invalid application key",
        ESSL => "SSL verification failed",
        EGOINGOVERQUOTA => "not enough quota",
        EMFAREQUIRED => "multi-factor authentication required",
        _ => "unknown error",
    }
}

/// Map a negative API result code onto the shared error taxonomy.
pub fn error_from_code(code: i64, command: &str) -> Error {
    let msg = format!("{} ({}) in '{}'", describe(code), code, command);
    match code {
        EINTERNAL | EAGAIN | ERATELIMIT | ETOOMANY | ETEMPUNAVAIL | ETOOMANYCONNECTIONS => {
            Error::Transient(msg)
        }
        ENOENT => Error::NotFound(msg),
        EACCESS | EBLOCKED | EOVERQUOTA | EGOINGOVERQUOTA => Error::PermissionDenied(msg),
        EEXIST => Error::AlreadyExists(msg),
        EKEY => Error::Crypto(msg),
        ESID => Error::InvalidState(msg),
        EMFAREQUIRED | EAPPKEY => Error::Authentication(msg),
        EARGS | ERANGE | ECIRCULAR => Error::InvalidInput(msg),
        _ => Error::Network(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(error_from_code(EAGAIN, "f").is_transient());
        assert!(error_from_code(ERATELIMIT, "f").is_transient());
        assert!(matches!(error_from_code(ENOENT, "g"), Error::NotFound(_)));
        assert!(matches!(error_from_code(ESID, "f"), Error::InvalidState(_)));
        assert!(matches!(error_from_code(EEXIST, "p"), Error::AlreadyExists(_)));
    }

    #[test]
    fn test_message_names_command() {
        let err = error_from_code(EACCESS, "d");
        assert!(err.to_string().contains("'d'"));
        assert!(err.to_string().contains("-11"));
    }
}
