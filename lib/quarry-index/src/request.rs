//! Request and response shapes for the index session.

use quarry_common::Status;

use crate::name::{RecordMetadata, RecordName};

/// What the caller wants done with a record name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    /// Insert if absent; report the existing metadata on a duplicate.
    Post,
    /// Insert or overwrite.
    Update,
    /// Look up, renewing the record's place in the index as a post
    /// would.
    Query,
    /// Look up without any renewal effect.
    QueryNoUpdate,
}

/// Completion delivered to the request callback.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: Status,
    pub kind: RequestKind,
    pub found: bool,
    /// Metadata previously stored under the name, when found.
    pub old_metadata: Option<RecordMetadata>,
    /// Metadata the request carried.
    pub new_metadata: RecordMetadata,
}

/// Completion callback; invoked exactly once, on a session worker task.
pub type Callback = Box<dyn FnOnce(Response) + Send + 'static>;

/// One deduplication request.
pub struct Request {
    pub kind: RequestKind,
    pub name: RecordName,
    pub new_metadata: RecordMetadata,
    pub(crate) on_complete: Callback,
}

impl Request {
    pub fn new(
        kind: RequestKind,
        name: RecordName,
        new_metadata: RecordMetadata,
        on_complete: Callback,
    ) -> Self {
        Request {
            kind,
            name,
            new_metadata,
            on_complete,
        }
    }

    /// Hashes a content block into its record name and builds the
    /// request around it.
    pub fn from_content(
        kind: RequestKind,
        data: &[u8],
        new_metadata: RecordMetadata,
        on_complete: Callback,
    ) -> Self {
        Request::new(kind, RecordName::from_content(data), new_metadata, on_complete)
    }

    pub(crate) fn complete(self, status: Status, found: bool, old: Option<RecordMetadata>) {
        let response = Response {
            status,
            kind: self.kind,
            found,
            old_metadata: old,
            new_metadata: self.new_metadata,
        };
        (self.on_complete)(response);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
