use crossbeam::channel::{Receiver, Sender};
use djbooth_core::{DjRequest, PlayerErrorCode, SessionMember};

pub type EventSender = Sender<BoothEvent>;
pub type EventReceiver = Receiver<BoothEvent>;

/// Events surfaced to whoever embeds a booth.
#[derive(Debug, Clone)]
pub enum BoothEvent {
    /// Any state slice changed, with the dot-style paths of what did
    StateChanged { changed: Vec<String> },
    /// The DJ role changed hands or became vacant
    RoleChanged { dj_user_id: Option<String> },
    MemberJoined { member: SessionMember },
    MemberLeft { user_id: String },
    /// A member was removed for missing too many liveness rounds
    MemberEvicted { user_id: String },
    /// Someone asked the local participant, as the holder, for the DJ role
    DjRequestReceived { request: DjRequest },
    /// A listener-side seek was issued to catch up with the DJ
    DriftCorrected { drift: f32 },
    /// A player error that could not be auto-recovered
    PlayerErrorSurfaced { code: PlayerErrorCode },
    /// A broadcast exhausted its retries; local state is applied regardless
    BroadcastFailed { description: String },
}
