use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use tracing::{event, Level};

use conveyor_workers::Workers;

async fn health() -> impl Responder {
    HttpResponse::Ok().finish()
}

async fn stats(workers: web::Data<Arc<Workers>>) -> impl Responder {
    match workers.queue_stats().await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => {
            event!(Level::ERROR, error=%e, "Failed to gather queue stats");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

/// Mount the stats routes on an existing actix app.
pub fn config(workers: Arc<Workers>) -> impl Fn(&mut web::ServiceConfig) + Clone {
    move |cfg| {
        cfg.app_data(web::Data::new(workers.clone()))
            .route("/healthz", web::get().to(health))
            .route("/stats", web::get().to(stats));
    }
}

/// Serve `/stats` and `/healthz` until the server is shut down.
pub async fn run_server(workers: Arc<Workers>, port: u16) -> std::io::Result<()> {
    event!(
        Level::INFO,
        port = %port,
        "Stats are available at http://localhost:{}/stats",
        port
    );

    HttpServer::new(move || App::new().configure(config(workers.clone())))
        .bind(("0.0.0.0", port))?
        .run()
        .await
}
