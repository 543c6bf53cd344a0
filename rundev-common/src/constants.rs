//! Wire-protocol constants shared between the client and the daemon.

/// Request header carrying the sender's root fingerprint; responses carry the
/// daemon's current fingerprint under the same name.
pub const HDR_CHECKSUM: &str = "rundev-checksum";

/// Patch precondition header: the remote fingerprint the client believes is
/// current. The daemon rejects the patch with 412 when it has moved on.
pub const HDR_PATCH_PRECONDITION_SUM: &str = "rundev-apply-if-checksum";

/// Per-session token authenticating the client to the patch endpoint.
pub const HDR_CLIENT_SECRET: &str = "rundev-client-secret";

/// Header-only signal instructing the syncing transport to retry. Test hook.
pub const MIME_DUMB_REPEAT: &str = "application/vnd.rundev.repeat";

/// Body is the daemon's current tree as JSON; triggers a patch cycle.
pub const MIME_CHECKSUM_MISMATCH: &str = "application/vnd.rundev.checksumMismatch+json";

/// Body is a gzip-compressed tar patch.
pub const MIME_PATCH: &str = "application/vnd.rundev.patch+tar";

/// Body is a JSON [`crate::types::ProcError`]; the transport surfaces it to
/// the user without retrying.
pub const MIME_PROCESS_ERROR: &str = "application/vnd.rundev.procError+json";

/// Tar entry suffix encoding a recursive deletion at the stripped path.
pub const WHITEOUT_DELETE_SUFFIX: &str = ".whiteout.del";
