//! Service name registry.
//!
//! A service is an endpoint `(process, message id)` advertised under a
//! fixed-width name. The directory holds every registration ordered by
//! `(pid, message id)`, which is exactly the pagination order the lookup
//! syscalls expose, plus the appearance/disappearance subscriptions.
//!
//! Directory mutations return the kernel notifications they imply instead
//! of sending them; the caller dispatches. That keeps the directory a pure
//! structure.

use alloc::vec::Vec;

use spin::Mutex;

/// Service names are 10 machine words (80 bytes).
pub const SERVICE_NAME_WORDS: usize = 10;
pub const SERVICE_NAME_LENGTH: usize = SERVICE_NAME_WORDS * 8;

/// A bounded service name, stored as the words it is marshaled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceName([u64; SERVICE_NAME_WORDS]);

impl ServiceName {
    pub const fn from_words(words: [u64; SERVICE_NAME_WORDS]) -> Self {
        Self(words)
    }

    pub fn words(&self) -> &[u64; SERVICE_NAME_WORDS] {
        &self.0
    }

    /// Build a name from a string, truncating to the fixed width.
    pub fn from_str(name: &str) -> Self {
        let mut bytes = [0u8; SERVICE_NAME_LENGTH];
        let len = name.len().min(SERVICE_NAME_LENGTH);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        let mut words = [0u64; SERVICE_NAME_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *word = u64::from_le_bytes(chunk);
        }
        Self(words)
    }
}

/// A kernel message the directory wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Receiver pid.
    pub pid: u64,
    /// The message id the receiver chose when subscribing.
    pub message_id: u64,
    /// `(service pid, service message id)`.
    pub service: (u64, u64),
}

#[derive(Debug, Clone)]
struct AppearanceSubscription {
    subscriber: u64,
    name: ServiceName,
    message_id: u64,
}

#[derive(Debug, Clone)]
struct DisappearanceSubscription {
    subscriber: u64,
    target_pid: u64,
    target_message_id: u64,
    message_id: u64,
}

/// The global registry state.
pub struct ServiceDirectory {
    /// `(pid, message id) -> name`, iterated in pagination order.
    services: alloc::collections::BTreeMap<(u64, u64), ServiceName>,
    appearance: Vec<AppearanceSubscription>,
    disappearance: Vec<DisappearanceSubscription>,
}

impl ServiceDirectory {
    pub const fn new() -> Self {
        Self {
            services: alloc::collections::BTreeMap::new(),
            appearance: Vec::new(),
            disappearance: Vec::new(),
        }
    }

    /// Register a service and collect the appearance notifications it
    /// triggers. A duplicate registration (same process, same message id)
    /// is silently discarded.
    pub fn register(
        &mut self,
        pid: u64,
        message_id: u64,
        name: ServiceName,
    ) -> Vec<Notification> {
        if self.services.contains_key(&(pid, message_id)) {
            return Vec::new();
        }
        self.services.insert((pid, message_id), name);

        self.appearance
            .iter()
            .filter(|sub| sub.name == name)
            .map(|sub| Notification {
                pid: sub.subscriber,
                message_id: sub.message_id,
                service: (pid, message_id),
            })
            .collect()
    }

    /// Unregister one service and collect its disappearance notifications.
    pub fn unregister(&mut self, pid: u64, message_id: u64) -> Vec<Notification> {
        if self.services.remove(&(pid, message_id)).is_none() {
            return Vec::new();
        }
        self.disappearance
            .iter()
            .filter(|sub| sub.target_pid == pid && sub.target_message_id == message_id)
            .map(|sub| Notification {
                pid: sub.subscriber,
                message_id: sub.message_id,
                service: (pid, message_id),
            })
            .collect()
    }

    /// Drop everything a dying process owns: its services (with
    /// notifications) and its subscriptions of both kinds.
    pub fn remove_process(&mut self, pid: u64) -> Vec<Notification> {
        let owned: Vec<u64> = self
            .services
            .range((pid, 0)..=(pid, u64::MAX))
            .map(|(&(_, mid), _)| mid)
            .collect();
        let mut notifications = Vec::new();
        for mid in owned {
            notifications.extend(self.unregister(pid, mid));
        }
        self.appearance.retain(|sub| sub.subscriber != pid);
        self.disappearance.retain(|sub| sub.subscriber != pid);
        notifications
    }

    /// Services with this exact name, starting at the `(min_pid, min_mid)`
    /// cursor, in pagination order.
    pub fn matches_from(
        &self,
        name: &ServiceName,
        min_pid: u64,
        min_message_id: u64,
    ) -> impl Iterator<Item = (u64, u64)> + '_ {
        let name = *name;
        self.services
            .range((min_pid, min_message_id)..)
            .filter(move |(_, n)| **n == name)
            .map(|(&key, _)| key)
    }

    /// The matching service after `(pid, message_id)`, exclusive.
    pub fn next_match_after(
        &self,
        name: &ServiceName,
        pid: u64,
        message_id: u64,
    ) -> Option<(u64, u64)> {
        let start = if message_id == u64::MAX {
            (pid + 1, 0)
        } else {
            (pid, message_id + 1)
        };
        self.matches_from(name, start.0, start.1).next()
    }

    pub fn name_of(&self, pid: u64, message_id: u64) -> Option<ServiceName> {
        self.services.get(&(pid, message_id)).copied()
    }

    /// Subscribe to appearances of `name`. Also returns one notification
    /// per already-registered matching service.
    pub fn subscribe_appearance(
        &mut self,
        subscriber: u64,
        name: ServiceName,
        message_id: u64,
    ) -> Vec<Notification> {
        self.appearance.push(AppearanceSubscription {
            subscriber,
            name,
            message_id,
        });
        self.services
            .iter()
            .filter(|(_, n)| **n == name)
            .map(|(&(pid, mid), _)| Notification {
                pid: subscriber,
                message_id,
                service: (pid, mid),
            })
            .collect()
    }

    /// Cancel every appearance subscription this process made with this
    /// message id.
    pub fn unsubscribe_appearance(&mut self, subscriber: u64, message_id: u64) {
        self.appearance
            .retain(|sub| !(sub.subscriber == subscriber && sub.message_id == message_id));
    }

    /// Subscribe to the disappearance of one specific service.
    pub fn subscribe_disappearance(
        &mut self,
        subscriber: u64,
        target_pid: u64,
        target_message_id: u64,
        message_id: u64,
    ) {
        self.disappearance.push(DisappearanceSubscription {
            subscriber,
            target_pid,
            target_message_id,
            message_id,
        });
    }

    pub fn unsubscribe_disappearance(&mut self, subscriber: u64, message_id: u64) {
        self.disappearance
            .retain(|sub| !(sub.subscriber == subscriber && sub.message_id == message_id));
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

static SERVICE_DIRECTORY: Mutex<ServiceDirectory> = Mutex::new(ServiceDirectory::new());

/// Run `f` with the global directory locked.
pub fn with_directory<R>(f: impl FnOnce(&mut ServiceDirectory) -> R) -> R {
    f(&mut SERVICE_DIRECTORY.lock())
}

/// Deliver directory notifications as kernel messages carrying the service
/// endpoint in the first two parameters.
pub fn dispatch(notifications: Vec<Notification>) {
    for notification in notifications {
        if let Some(receiver) =
            crate::process::process_from_pid(crate::process::ProcessId(notification.pid))
        {
            crate::ipc::send_kernel_message_to_process(
                &receiver,
                notification.message_id,
                notification.service.0,
                notification.service.1,
                0,
                0,
                0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ServiceName {
        ServiceName::from_str(s)
    }

    #[test]
    fn registration_notifies_matching_subscribers() {
        let mut directory = ServiceDirectory::new();
        let burst = directory.subscribe_appearance(3, name("foo"), 77);
        assert!(burst.is_empty());

        // Seed scenario: C (pid 3) subscribed to "foo"; D (pid 4)
        // registers ("foo", 42); C gets one notification carrying (4, 42).
        let notifications = directory.register(4, 42, name("foo"));
        assert_eq!(
            notifications,
            alloc::vec![Notification {
                pid: 3,
                message_id: 77,
                service: (4, 42),
            }]
        );

        // A non-matching name stays quiet.
        assert!(directory.register(5, 1, name("bar")).is_empty());
    }

    #[test]
    fn subscription_fires_for_preexisting_services() {
        let mut directory = ServiceDirectory::new();
        directory.register(4, 42, name("foo"));
        directory.register(6, 9, name("foo"));
        directory.register(5, 2, name("bar"));

        let burst = directory.subscribe_appearance(3, name("foo"), 77);
        let services: Vec<(u64, u64)> = burst.iter().map(|n| n.service).collect();
        assert_eq!(services, alloc::vec![(4, 42), (6, 9)]);
    }

    #[test]
    fn duplicate_registration_is_silently_discarded() {
        let mut directory = ServiceDirectory::new();
        assert!(directory.register(4, 42, name("foo")).is_empty());
        let before = directory.name_of(4, 42).unwrap();
        directory.register(4, 42, name("other"));
        assert_eq!(directory.name_of(4, 42).unwrap(), before);
        assert_eq!(directory.service_count(), 1);
    }

    #[test]
    fn pagination_walks_pid_then_mid_order() {
        let mut directory = ServiceDirectory::new();
        directory.register(2, 30, name("svc"));
        directory.register(2, 10, name("svc"));
        directory.register(5, 1, name("svc"));
        directory.register(3, 7, name("other"));

        let all: Vec<(u64, u64)> = directory.matches_from(&name("svc"), 0, 0).collect();
        assert_eq!(all, alloc::vec![(2, 10), (2, 30), (5, 1)]);

        // Cursor resumes mid-process.
        let from_cursor: Vec<(u64, u64)> =
            directory.matches_from(&name("svc"), 2, 11).collect();
        assert_eq!(from_cursor, alloc::vec![(2, 30), (5, 1)]);

        // find-next is exclusive of its start.
        assert_eq!(
            directory.next_match_after(&name("svc"), 2, 30),
            Some((5, 1))
        );
        assert_eq!(directory.next_match_after(&name("svc"), 5, 1), None);
    }

    #[test]
    fn disappearance_fires_on_unregistration_and_death() {
        let mut directory = ServiceDirectory::new();
        directory.register(4, 42, name("foo"));
        directory.register(4, 50, name("foo"));
        directory.subscribe_disappearance(3, 4, 42, 88);

        // Unregistering an unrelated service is quiet.
        assert!(directory.unregister(4, 50).is_empty());

        directory.register(4, 50, name("foo"));
        let notifications = directory.remove_process(4);
        assert_eq!(
            notifications,
            alloc::vec![Notification {
                pid: 3,
                message_id: 88,
                service: (4, 42),
            }]
        );
        assert_eq!(directory.service_count(), 0);
    }

    #[test]
    fn removing_a_process_drops_its_subscriptions() {
        let mut directory = ServiceDirectory::new();
        directory.subscribe_appearance(3, name("foo"), 77);
        directory.remove_process(3);
        assert!(directory.register(4, 42, name("foo")).is_empty());
    }

    #[test]
    fn unsubscribe_appearance_stops_notifications() {
        let mut directory = ServiceDirectory::new();
        directory.subscribe_appearance(3, name("foo"), 77);
        directory.unsubscribe_appearance(3, 77);
        assert!(directory.register(4, 42, name("foo")).is_empty());
    }
}
