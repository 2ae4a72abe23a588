// Session context for the signed-in viewer.
// Created once at login and handed by reference to everything that needs the
// bearer token or the viewer's id; dropping it is the logout.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    user_id: String,
    display_name: String,
}

impl Session {
    pub fn new(token: &str, user_id: &str, display_name: &str) -> Self {
        Session {
            token: token.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Whether `user_id` refers to the signed-in viewer
    pub fn is_viewer(&self, user_id: &str) -> bool {
        is_viewer_id(&self.user_id, user_id)
    }
}

/// Same check for code that only keeps the viewer's id; an empty id never matches
pub fn is_viewer_id(viewer_id: &str, user_id: &str) -> bool {
    !user_id.is_empty() && viewer_id == user_id
}
