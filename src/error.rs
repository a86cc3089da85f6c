// This file is part of TESSERA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// TESSERA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TESSERA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TESSERA. If not, see <https://www.gnu.org/licenses/>.

//! Library error codes and results.

use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
///
/// `ParentNotFound` and `BlockAlreadySaved` are control signals consumed by
/// the producer and the syncer to pick the sync direction or to no-op, they
/// are not failures of the caller's intent.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ErrorKind {
    MalformedData,
    InvalidSignature,
    ExpiredTrx,
    DuplicatedTrx,
    PayloadTooLarge,
    NotAuthorized,
    ParentNotFound,
    BlockAlreadySaved,
    ResourceNotFound,
    DatabaseFault,
    CryptoFault,
    SyncFailed,
    NotImplemented,
    Other,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const INVALID_SIGNATURE: &str = "invalid signature";
    pub const EXPIRED_TRX: &str = "expired transaction";
    pub const DUPLICATED_TRX: &str = "duplicated transaction";
    pub const PAYLOAD_TOO_LARGE: &str = "payload too large";
    pub const NOT_AUTHORIZED: &str = "not authorized";
    pub const PARENT_NOT_FOUND: &str = "parent block not found";
    pub const BLOCK_ALREADY_SAVED: &str = "block already saved";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const DATABASE_FAULT: &str = "database fault";
    pub const CRYPTO_FAULT: &str = "crypto fault";
    pub const SYNC_FAILED: &str = "synchronization failed";
    pub const NOT_IMPLEMENTED: &str = "not implemented";
    pub const OTHER: &str = "other";
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            InvalidSignature => error_kind_str::INVALID_SIGNATURE,
            ExpiredTrx => error_kind_str::EXPIRED_TRX,
            DuplicatedTrx => error_kind_str::DUPLICATED_TRX,
            PayloadTooLarge => error_kind_str::PAYLOAD_TOO_LARGE,
            NotAuthorized => error_kind_str::NOT_AUTHORIZED,
            ParentNotFound => error_kind_str::PARENT_NOT_FOUND,
            BlockAlreadySaved => error_kind_str::BLOCK_ALREADY_SAVED,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            DatabaseFault => error_kind_str::DATABASE_FAULT,
            CryptoFault => error_kind_str::CRYPTO_FAULT,
            SyncFailed => error_kind_str::SYNC_FAILED,
            NotImplemented => error_kind_str::NOT_IMPLEMENTED,
            Other => error_kind_str::OTHER,
        };
        write!(f, "{}", kind_str)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propagated the error.
#[derive(Debug)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Optional error source.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = error.into();
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.source.is_none() && other.source.is_none() {
            true
        } else if self.source.is_some() && other.source.is_some() {
            format!("{:?}", self.source) == format!("{:?}", other.source)
        } else {
            false
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &format!("{}", self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use ErrorKind::*;

    #[test]
    fn generic_error_type() {
        let src1 = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");
        let src2 = io::Error::new(io::ErrorKind::TimedOut, "oh no!");
        let err1 = Error::new_ext(DatabaseFault, src1);
        let err2 = Error::new_ext(DatabaseFault, src2);

        assert_ne!(err1, err2);
    }

    #[test]
    fn external_db_failure() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");

        let error = Error::new_ext(DatabaseFault, source);

        assert_eq!(error.to_string(), "database fault");
        assert_eq!(error.to_string_full(), "database fault: oh no!");
        let source = std::error::Error::source(&error)
            .unwrap()
            .downcast_ref::<io::Error>()
            .unwrap();
        assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
        assert!(std::error::Error::source(&source).is_none());
    }

    #[test]
    fn control_signal_kinds_compare_by_kind() {
        let err1 = Error::new(ParentNotFound);
        let err2: Error = ParentNotFound.into();

        assert_eq!(err1, err2);
        assert_ne!(err1, Error::new(BlockAlreadySaved));
    }
}
