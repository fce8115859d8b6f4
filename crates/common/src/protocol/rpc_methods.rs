// RPC method name constants shared by the daemon dispatcher and the CLI.

// ── Daemon-internal ────────────────────────────────────────────────
pub const RPC_PING: &str = "rpc.ping";
pub const DAEMON_SHUTDOWN: &str = "daemon.shutdown";

// ── User ───────────────────────────────────────────────────────────
pub const USER_CREATE: &str = "user.create";
pub const USER_DELETE: &str = "user.delete";

// ── Document ───────────────────────────────────────────────────────
pub const DOC_CREATE: &str = "doc.create";
pub const DOC_GET: &str = "doc.get";
pub const DOC_FOLLOW: &str = "doc.follow";
pub const DOC_UNFOLLOW: &str = "doc.unfollow";
pub const DOC_AMENDMENTS: &str = "doc.amendments";
pub const DOC_AT_VERSION: &str = "doc.at_version";

// ── Amendment ──────────────────────────────────────────────────────
pub const AMEND_PROPOSE: &str = "amend.propose";
pub const AMEND_GET: &str = "amend.get";
pub const AMEND_VOTE: &str = "amend.vote";
pub const AMEND_PREVIEW: &str = "amend.preview";

// ── Activity ───────────────────────────────────────────────────────
pub const EVENTS_LIST: &str = "events.list";

/// All methods the daemon dispatches.
pub const IMPLEMENTED_METHODS: &[&str] = &[
    RPC_PING,
    DAEMON_SHUTDOWN,
    USER_CREATE,
    USER_DELETE,
    DOC_CREATE,
    DOC_GET,
    DOC_FOLLOW,
    DOC_UNFOLLOW,
    DOC_AMENDMENTS,
    DOC_AT_VERSION,
    AMEND_PROPOSE,
    AMEND_GET,
    AMEND_VOTE,
    AMEND_PREVIEW,
    EVENTS_LIST,
];
