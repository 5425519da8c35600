use crate::actions::Actions;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub actions: Actions,
}

impl AppState {
    pub fn new(actions: Actions) -> Self {
        Self { actions }
    }
}
