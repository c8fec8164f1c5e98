use shared::domain::ConnectionId;

pub(crate) fn connection_key(prefix: &str, id: &ConnectionId) -> String {
    format!("{prefix}#connection#{id}")
}

pub(crate) fn state_key(prefix: &str, id: &ConnectionId, module_name: &str) -> String {
    format!("{prefix}#state#{id}#{module_name}")
}
