//! A single call and its negotiation state.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::CallError;
use crate::manager::ManagerInner;
use crate::media::{MediaOptions, MediaStream, PeerConnection};

/// Call lifecycle.
///
/// `New → Offered → {Accepted → Connected} | Rejected | HungUp`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Created locally, offer not yet sent.
    New,
    /// Offer sent or received.
    Offered,
    /// The callee accepted; descriptions are being exchanged.
    Accepted,
    /// Local and remote descriptions are both applied.
    Connected,
    /// The callee declined.
    Rejected,
    /// Ended by either side.
    HungUp,
}

impl CallState {
    /// Whether the call is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::HungUp)
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Connected => "connected",
            Self::Rejected => "rejected",
            Self::HungUp => "hungup",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side placed the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// We sent the offer.
    Caller,
    /// We received the offer.
    Callee,
}

/// Media flags and stream for one side of a call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Audio is (or will be) sent.
    pub audio: bool,
    /// Video is (or will be) sent.
    pub video: bool,
    /// The stream, once available.
    pub stream: Option<MediaStream>,
}

impl MediaInfo {
    pub(crate) fn options(&self) -> MediaOptions {
        MediaOptions {
            audio: self.audio,
            video: self.video,
        }
    }

    /// Take the stream and derive the flags from its tracks.
    pub(crate) fn adopt(&mut self, stream: MediaStream) {
        self.audio = stream.has_audio();
        self.video = stream.has_video();
        self.stream = Some(stream);
    }
}

pub(crate) struct Session {
    pub(crate) state: CallState,
    pub(crate) local: MediaInfo,
    pub(crate) remote: MediaInfo,
    pub(crate) peer: Option<Arc<dyn PeerConnection>>,
    pub(crate) local_description: bool,
    pub(crate) remote_description: bool,
    /// Candidates that arrived before the remote description.
    pub(crate) pending_candidates: Vec<Value>,
}

pub(crate) struct CallInner {
    pub(crate) id: String,
    pub(crate) user: String,
    pub(crate) role: Role,
    pub(crate) session: Mutex<Session>,
    /// Stops the peer event task.
    pub(crate) cancel: CancellationToken,
    pub(crate) manager: Weak<ManagerInner>,
}

/// Handle to one call. Cheap to clone; clones observe the same call.
#[derive(Clone)]
pub struct Call {
    pub(crate) inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(
        id: String,
        user: String,
        role: Role,
        state: CallState,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id,
                user,
                role,
                session: Mutex::new(Session {
                    state,
                    local: MediaInfo::default(),
                    remote: MediaInfo::default(),
                    peer: None,
                    local_description: false,
                    remote_description: false,
                    pending_candidates: Vec::new(),
                }),
                cancel: CancellationToken::new(),
                manager,
            }),
        }
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock()
    }

    /// Call id shared by both sides.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The remote party.
    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// Which side we are.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current state.
    pub fn state(&self) -> CallState {
        self.session().state
    }

    /// Our media.
    pub fn local(&self) -> MediaInfo {
        self.session().local.clone()
    }

    /// The remote side's media.
    pub fn remote(&self) -> MediaInfo {
        self.session().remote.clone()
    }

    /// ICE candidates held until the remote description is applied.
    pub fn buffered_candidates(&self) -> usize {
        self.session().pending_candidates.len()
    }

    /// Accept an incoming call.
    ///
    /// Flags left unset in `options` mirror what the caller offered.
    pub async fn accept(&self, options: Option<MediaOptions>) -> Result<(), CallError> {
        self.manager()?.accept(self, options).await
    }

    /// Decline an incoming call.
    pub fn reject(&self) -> Result<(), CallError> {
        self.manager()?.reject(self)
    }

    /// End the call.
    pub fn hangup(&self) -> Result<(), CallError> {
        self.manager()?.hangup(self)
    }

    fn manager(&self) -> Result<Arc<ManagerInner>, CallError> {
        self.inner.manager.upgrade().ok_or(CallError::Detached)
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("user", &self.inner.user)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
