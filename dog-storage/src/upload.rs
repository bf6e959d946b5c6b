/// Initial request of a write stream.
///
/// Reconnecting writers keep this as a template and patch `upload_id` and
/// `write_offset` before asking a factory for a fresh stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteObjectRequest {
    pub bucket: String,
    pub object: String,
    pub content_type: Option<String>,
    /// Set when resuming an existing upload
    pub upload_id: Option<String>,
    /// Offset of the first byte the new stream will send
    pub write_offset: i64,
    pub if_generation_match: Option<i64>,
    /// Appendable objects can be resumed from any persisted offset
    pub appendable: bool,
}

impl WriteObjectRequest {
    pub fn new<B: Into<String>, O: Into<String>>(bucket: B, object: O) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            ..Default::default()
        }
    }

    /// Request resuming `upload_id`
    pub fn resume<S: Into<String>>(upload_id: S) -> Self {
        Self {
            upload_id: Some(upload_id.into()),
            ..Default::default()
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_upload_id<S: Into<String>>(mut self, upload_id: S) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn with_write_offset(mut self, offset: i64) -> Self {
        self.write_offset = offset;
        self
    }

    pub fn with_if_generation_match(mut self, generation: i64) -> Self {
        self.if_generation_match = Some(generation);
        self
    }

    pub fn appendable(mut self) -> Self {
        self.appendable = true;
        self
    }

    /// Whether this request resumes an existing upload
    pub fn is_resume(&self) -> bool {
        self.upload_id.is_some()
    }
}
