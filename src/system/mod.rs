pub mod crash_log;
pub mod reset;
pub mod uptime;
pub mod watchdog;
