/// Identity of whoever issued a request, as established upstream.
///
/// The gateway never validates tokens; it forwards them verbatim on every
/// collaborator call made on the caller's behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub token: Option<String>,
    pub is_admin: bool,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
            is_admin: false,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn can_access(&self, owner: &str) -> bool {
        self.is_admin || self.user_id == owner
    }
}
