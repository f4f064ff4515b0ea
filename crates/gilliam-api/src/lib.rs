//! gilliam-api — REST API for the Gilliam scheduler.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/work` | List work units |
//! | POST | `/api/v1/work` | Submit a work unit |
//! | GET | `/api/v1/work/{id}` | Work unit status |
//! | DELETE | `/api/v1/work/{id}` | Withdraw a work unit |
//! | POST | `/api/v1/work/{id}/running` | Node reports the unit started |
//! | POST | `/api/v1/work/{id}/complete` | Node reports the unit finished |
//! | POST | `/api/v1/work/{id}/fail` | Node reports the unit failed |
//! | GET | `/api/v1/nodes` | List nodes |
//! | POST | `/api/v1/nodes` | Register a node |
//! | GET | `/api/v1/nodes/{id}` | Node status |
//! | DELETE | `/api/v1/nodes/{id}` | Deregister a node |
//! | POST | `/api/v1/nodes/{id}/heartbeat` | Node heartbeat |
//! | GET | `/api/v1/leases` | List leases |
//! | GET | `/api/v1/leases/{id}` | Lease status |
//! | POST | `/api/v1/leases/{id}/renew` | Extend a lease |
//! | POST | `/api/v1/cycle` | Run a reconciliation cycle now |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use gilliam_scheduler::Scheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

/// Build the complete API router.
pub fn build_router(scheduler: Arc<Scheduler>) -> Router {
    let api_state = ApiState { scheduler };

    let api_routes = Router::new()
        .route("/work", get(handlers::list_work).post(handlers::submit_work))
        .route("/work/{id}", get(handlers::get_work).delete(handlers::withdraw_work))
        .route("/work/{id}/running", post(handlers::work_running))
        .route("/work/{id}/complete", post(handlers::work_complete))
        .route("/work/{id}/fail", post(handlers::work_failed))
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route("/nodes/{id}", get(handlers::get_node).delete(handlers::deregister_node))
        .route("/nodes/{id}/heartbeat", post(handlers::heartbeat))
        .route("/leases", get(handlers::list_leases))
        .route("/leases/{id}", get(handlers::get_lease))
        .route("/leases/{id}/renew", post(handlers::renew_lease))
        .route("/cycle", post(handlers::run_cycle))
        .with_state(api_state);

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .nest("/api/v1", api_routes)
}
