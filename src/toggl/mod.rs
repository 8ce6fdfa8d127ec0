//! Toggl entity models and the transport used to reach the API.

mod api_types;
mod client;
mod remote;
mod types;

pub use client::{classify_status, AsyncHttpRemote, HttpRemote};
pub use remote::{AsyncRemote, Method, Remote, Request, Response};
pub use types::{Client, Model, Organization, Project, ProjectStatus, Tag, Tracker, Workspace};
