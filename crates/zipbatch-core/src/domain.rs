/// Front-end user id (numeric chat user id, or a fixed id for local CLI use).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl UserId {
    /// Id used when the CLI drives the dispatcher directly.
    pub const LOCAL: UserId = UserId(0);
}
