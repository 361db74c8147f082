use kube::runtime::events::{Event, EventType};

#[must_use]
pub fn install_succeeded() -> Event {
    Event {
        type_: EventType::Normal,
        reason: "InstallSucceed".to_string(),
        note: None,
        action: "Install".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn install_failed(note: String) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "InstallFailed".to_string(),
        note: Some(note),
        action: "Install".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn uninstall_succeeded() -> Event {
    Event {
        type_: EventType::Normal,
        reason: "UninstallSucceed".to_string(),
        note: None,
        action: "Uninstall".to_string(),
        secondary: None,
    }
}
