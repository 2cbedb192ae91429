pub mod home;
pub mod model;

use axum::Router;

pub fn router() -> Router {
    Router::new().merge(home::router()).merge(model::router())
}
