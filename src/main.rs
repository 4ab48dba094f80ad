mod config;
mod error;
mod history;
mod messages;
mod presence;
mod room;
mod server;

use std::sync::Arc;

use log::info;
use warp::Filter;

use crate::config::Config;
use crate::history::MemoryChatLog;
use crate::server::Server;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::from_env();
    let history = Arc::new(MemoryChatLog::new(
        config.history_window,
        config.history_retain,
    ));
    let server = Arc::new(Server::new(history));

    let ws_server = Arc::clone(&server);
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = Arc::clone(&ws_server);
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let static_files = warp::fs::dir(config.static_dir.clone());

    // Origin policy comes from the environment; the default is open.
    let cors = match &config.allowed_origin {
        Some(origin) => warp::cors()
            .allow_origin(origin.as_str())
            .allow_methods(vec!["GET", "POST"]),
        None => warp::cors().allow_any_origin().allow_methods(vec!["GET", "POST"]),
    };

    let routes = ws_route.or(static_files).with(cors);

    info!("lobby server listening on port {}", config.port);
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;
}
