use std::sync::Arc;
use std::thread;
use std::time::Duration;

use iec104_slave::{
    AsduHandler, ConnectionEventHandler, ConnectionFacade, HandlerResult, Server, ServerConfig,
};

struct LoggingAsduHandler;

impl AsduHandler for LoggingAsduHandler {
    fn interrogation(&self, conn: &ConnectionFacade, asdu: &iec104_slave::asdu::AsduView) -> HandlerResult {
        log::info!(
            "interrogation command from {}, responding with activation confirmation",
            conn.peer_address()
        );
        let _ = conn.send_act_con(asdu.raw(), false);
        HandlerResult::Handled
    }
}

struct LoggingEventHandler;

impl ConnectionEventHandler for LoggingEventHandler {
    fn opened(&self, conn: &ConnectionFacade) {
        log::info!("connection opened: {}", conn.peer_address());
    }

    fn closed(&self, conn: &ConnectionFacade) {
        log::info!("connection closed: {}", conn.peer_address());
    }

    fn activated(&self, conn: &ConnectionFacade) {
        log::info!("connection activated: {}", conn.peer_address());
    }

    fn deactivated(&self, conn: &ConnectionFacade) {
        log::info!("connection deactivated: {}", conn.peer_address());
    }
}

fn main() {
    env_logger::init();

    let config = ServerConfig {
        port: 2404,
        ..Default::default()
    };

    let server = Server::new(
        config,
        Vec::new(),
        Arc::new(LoggingAsduHandler),
        Arc::new(LoggingEventHandler),
    )
    .expect("invalid server configuration");

    let _scheduler =
        iec104_slave::ThreadedScheduler::start(server.clone()).expect("failed to bind listener");

    println!(">>> Listening for IEC 60870-5-104 connections on port 2404");

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
