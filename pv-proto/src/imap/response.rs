//! Response assembly: every command handler returns one `Response`, a tagged
//! completion plus zero or more untagged `Body` elements, built through
//! `Response::build()` so every handler produces the same well-formed shape
//! regardless of how many data items it emits.

use anyhow::Result;
use imap_codec::imap_types::command::Command;
use imap_codec::imap_types::core::{Tag, Text};
use imap_codec::imap_types::response::{Code, Data, Status};
use tokio::sync::Notify;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Body<'a> {
    Data(Data<'a>),
    Status(Status<'a>),
}

#[derive(Debug, Clone)]
pub struct Response<'a> {
    pub body: Vec<Body<'a>>,
    pub completion: Status<'a>,
}

impl Response<'static> {
    pub fn build() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub fn bye() -> Result<Self> {
        Ok(Self {
            body: vec![],
            completion: Status::bye(None, "Server shutting down").map_err(anyhow::Error::msg)?,
        })
    }
}

#[derive(Default)]
pub struct ResponseBuilder {
    tag: Option<Tag<'static>>,
    code: Option<Code<'static>>,
    message: String,
    data: Vec<Data<'static>>,
    untagged_status: Vec<Status<'static>>,
}

impl ResponseBuilder {
    pub fn to_req(mut self, req: &Command<'static>) -> Self {
        self.tag = Some(req.tag.clone());
        self
    }

    pub fn tag(mut self, tag: Tag<'static>) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn code(mut self, code: Code<'static>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn data(mut self, data: Data<'static>) -> Self {
        self.data.push(data);
        self
    }

    pub fn many_data(mut self, data: Vec<Data<'static>>) -> Self {
        self.data.extend(data);
        self
    }

    /// Pushes each item of a pre-built `Data` batch, used by SELECT/EXAMINE
    /// summaries which produce several untagged lines at once.
    pub fn set_body(mut self, data: Vec<Data<'static>>) -> Self {
        self.data.extend(data);
        self
    }

    /// Pushes an untagged `* OK [code] text` line, e.g. the PERMANENTFLAGS
    /// line a SELECT/EXAMINE response carries alongside its tagged
    /// completion (RFC 3501 §6.3.1).
    pub fn untagged_ok(
        mut self,
        code: Code<'static>,
        message: impl Into<String>,
    ) -> Result<Self> {
        let text = Text::try_from(message.into()).map_err(anyhow::Error::msg)?;
        let status = Status::ok(None, Some(code), text).map_err(anyhow::Error::msg)?;
        self.untagged_status.push(status);
        Ok(self)
    }

    fn finish(self, make: impl FnOnce(Option<Tag<'static>>, Option<Code<'static>>, Text<'static>) -> std::result::Result<Status<'static>, imap_codec::imap_types::error::ValidationError>) -> Result<Response<'static>> {
        let text = Text::try_from(if self.message.is_empty() {
            "done".to_string()
        } else {
            self.message
        })
        .map_err(anyhow::Error::msg)?;
        let completion = make(self.tag, self.code, text).map_err(anyhow::Error::msg)?;
        let mut body: Vec<Body<'static>> = self.untagged_status.into_iter().map(Body::Status).collect();
        body.extend(self.data.into_iter().map(Body::Data));
        Ok(Response { body, completion })
    }

    pub fn ok(self) -> Result<Response<'static>> {
        self.finish(Status::ok)
    }

    pub fn no(self) -> Result<Response<'static>> {
        self.finish(Status::no)
    }

    pub fn bad(self) -> Result<Response<'static>> {
        self.finish(Status::bad)
    }
}

/// What the session loop does with a command's outcome: either a normal
/// tagged response, or a transition into/out of IDLE.
pub enum ResponseOrIdle {
    Response(Response<'static>),
    IdleAccept(Arc<Notify>),
    IdleReject(Response<'static>),
    IdleEvent(Vec<Body<'static>>),
}

impl std::fmt::Debug for ResponseOrIdle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(r) => write!(f, "Response({:?})", r.completion),
            Self::IdleAccept(_) => write!(f, "IdleAccept"),
            Self::IdleReject(_) => write!(f, "IdleReject"),
            Self::IdleEvent(b) => write!(f, "IdleEvent({} items)", b.len()),
        }
    }
}
