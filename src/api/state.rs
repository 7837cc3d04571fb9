use crate::engine::ModelEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: ModelEngine,
}
