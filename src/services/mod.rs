pub mod runner_service;
