use std::time::Duration;

use notify_core::NotifyService;

#[derive(Clone)]
pub struct AppState {
    pub service: NotifyService,
    pub keep_alive: Duration,
}
