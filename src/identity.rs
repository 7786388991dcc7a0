//! Host and user identity for workers and registered pools.

use crate::error::{Error, Result};
use nix::unistd::{Uid, User, gethostname};

fn hostname() -> Result<String> {
    let name = gethostname().map_err(|e| Error::Identity(format!("unable to get hostname: {e}")))?;
    name.into_string()
        .map_err(|raw| Error::Identity(format!("hostname is not valid UTF-8: {raw:?}")))
}

fn username() -> Result<String> {
    let uid = Uid::current();
    match User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(Error::Identity(format!("no passwd entry for uid {uid}"))),
        Err(e) => Err(Error::Identity(format!("unable to get current user: {e}"))),
    }
}

/// Short random suffix distinguishing workers on one host.
pub fn instance_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Worker identity: `<host>:<suffix>`.
pub fn worker_id(suffix: &str) -> Result<String> {
    Ok(format!("{}:{suffix}", hostname()?))
}

/// Pool identity advertised in the membership set: `<user>@<host>`.
pub fn server_id() -> Result<String> {
    Ok(format!("{}@{}", username()?, hostname()?))
}
