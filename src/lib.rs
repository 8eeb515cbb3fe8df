//! Story-driven background coding runs: clone a repository, plan the work
//! as reviewable user stories, execute them one at a time with a coding
//! agent, and publish the result as a branch and pull request. Humans stay
//! in the loop through durable approval gates.

pub mod agent;
pub mod config;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod orchestrator;
pub mod planner;
pub mod prd;
pub mod publisher;
pub mod server;
pub mod status;
pub mod stream;
pub mod tracker;
pub mod workspace;
