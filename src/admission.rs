//! Early-rejection gates: bans, overload, and free-account quotas, driven
//! by cached observations that refresh at a bounded rate.
//!
//! The cache is written only inside the regular check (or a forced reload);
//! every accept reads it. `SystemStats` and `BanSource` are the seams to
//! the live system: shared-memory observables and the ban-IP table are
//! maintained elsewhere.

use crate::config::Settings;
use crate::screen::{self, OverloadKind};
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};

/// Site-wide dynamic user caps below this are treated as misconfigured.
const DYNAMIC_ACTIVE_FLOOR: usize = 2000;

/// Observables of the running system, normally backed by shared memory.
pub trait SystemStats: Send + Sync {
    fn cpu_load(&self) -> f64;
    fn active_users(&self) -> usize;
    /// Operator-adjustable cap on active users, if the site carries one.
    fn dynamic_max_active(&self) -> Option<usize> {
        None
    }
    /// Bumped whenever the user cap turns a connection away.
    fn note_user_overload(&self) {}
    /// Resolve a userid to its numeric id in the user table.
    fn search_user(&self, userid: &str) -> Option<u32>;
    /// Whether `usernum` holds at least `count` live sessions.
    fn user_online_at_least(&self, usernum: u32, count: usize) -> bool;
}

pub trait BanSource: Send + Sync {
    fn is_banned(&self, ip: Ipv4Addr) -> bool;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Overload {
    #[default]
    None,
    Cpu,
    Users,
}

/// Verdict for a freshly accepted connection.
pub enum Gate {
    Banned(Option<Arc<str>>),
    Overload(OverloadKind),
    Welcome(Option<Arc<str>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeIdCheck {
    pub is_free: bool,
    pub allowed: bool,
}

#[derive(Debug, Default)]
struct CachedState {
    welcome: Option<Arc<str>>,
    goodbye: Option<Arc<str>>,
    ban: Option<Arc<str>>,
    welcome_mtime: Option<SystemTime>,
    overload: Overload,
    banned: bool,
    guest_too_many: bool,
    guest_usernum: u32,
    last_check: Option<Instant>,
}

pub struct Admission {
    settings: Arc<Settings>,
    stats: Arc<dyn SystemStats>,
    bans: Arc<dyn BanSource>,
    cache: RwLock<CachedState>,
    reload_pending: AtomicBool,
}

impl Admission {
    pub fn new(settings: Arc<Settings>, stats: Arc<dyn SystemStats>, bans: Arc<dyn BanSource>) -> Self {
        Self {
            settings,
            stats,
            bans,
            cache: RwLock::new(CachedState::default()),
            // load the text screens on the very first accept
            reload_pending: AtomicBool::new(true),
        }
    }

    /// Ask for a full banner reload on the next accept (SIGHUP path).
    pub fn request_reload(&self) {
        self.reload_pending.store(true, Ordering::Relaxed);
    }

    /// Refresh cached admission state; called on every accept, cheap when
    /// the check interval has not elapsed and no reload is pending.
    pub fn reload(&self) {
        self.regular_check();

        if self.reload_pending.swap(false, Ordering::Relaxed) {
            tracing::info!("reloading text screens");
            let lines = self.settings.max_screen_lines;
            let mut c = self.cache.write();
            c.welcome_mtime = mtime(&self.settings.welcome_file());
            c.welcome = load(&self.settings.welcome_file(), lines);
            c.goodbye = load(&self.settings.goodbye_file(), lines);
            c.ban = load(&self.settings.ban_file(), lines);
        }
    }

    fn regular_check(&self) {
        let interval = self.settings.regular_check_interval;
        {
            let c = self.cache.read();
            if let Some(last) = c.last_check
                && last.elapsed() < interval
            {
                return;
            }
        }

        let mut c = self.cache.write();
        if let Some(last) = c.last_check
            && last.elapsed() < interval
        {
            return; // someone else got here first
        }
        c.last_check = Some(Instant::now());

        c.overload = if self.stats.cpu_load() > self.settings.max_cpu_load {
            Overload::Cpu
        } else {
            let active = self.stats.active_users();
            let dynamic_cap = self
                .stats
                .dynamic_max_active()
                .filter(|&d| d > DYNAMIC_ACTIVE_FLOOR);
            if active >= self.settings.max_active
                || dynamic_cap.is_some_and(|d| active >= d)
            {
                self.stats.note_user_overload();
                Overload::Users
            } else {
                Overload::None
            }
        };

        if !self.settings.dont_check_free_userid {
            c.guest_too_many = false;
            c.guest_usernum = 0;
        }

        let ban_file = self.settings.ban_file();
        c.banned = ban_file.is_file();
        if c.banned {
            c.ban = load(&ban_file, self.settings.max_screen_lines);
        }

        if mtime(&self.settings.welcome_file()) != c.welcome_mtime {
            tracing::debug!("welcome screen changed on disk, scheduling reload");
            self.reload_pending.store(true, Ordering::Relaxed);
        }
    }

    /// Gate a freshly accepted connection, in ban -> overload order.
    pub fn gate(&self, ip: Ipv4Addr) -> Gate {
        let c = self.cache.read();
        if c.banned || self.bans.is_banned(ip) {
            return Gate::Banned(c.ban.clone());
        }
        match c.overload {
            Overload::Cpu => Gate::Overload(OverloadKind::Cpu),
            Overload::Users => Gate::Overload(OverloadKind::Users),
            Overload::None => Gate::Welcome(c.welcome.clone()),
        }
    }

    pub fn goodbye(&self) -> Option<Arc<str>> {
        self.cache.read().goodbye.clone()
    }

    pub fn online_users(&self) -> usize {
        self.stats.active_users()
    }

    /// Decide whether `userid` is a free sentinel and, if so, whether its
    /// quota admits another session. The guest verdict is cached until the
    /// next regular check, so a full house rejects without touching the
    /// live-user table.
    pub fn check_free_userid(&self, userid: &str) -> FreeIdCheck {
        let not_free = FreeIdCheck {
            is_free: false,
            allowed: false,
        };
        let admitted = FreeIdCheck {
            is_free: true,
            allowed: true,
        };

        if let Some(new_id) = &self.settings.regnew_id
            && userid.eq_ignore_ascii_case(new_id)
        {
            return admitted;
        }

        let Some(guest) = &self.settings.guest_id else {
            return not_free;
        };
        if !userid.eq_ignore_ascii_case(guest) {
            return not_free;
        }

        if self.settings.dont_check_free_userid {
            return admitted;
        }
        let Some(max_guest) = self.settings.max_guest else {
            return admitted;
        };

        // fast reject on the cached verdict until the next regular check
        if self.cache.read().guest_too_many {
            return FreeIdCheck {
                is_free: true,
                allowed: false,
            };
        }

        let mut c = self.cache.write();
        if c.guest_usernum == 0 {
            tracing::debug!(%guest, "resolving guest account");
            c.guest_usernum = self.stats.search_user(guest).unwrap_or(0);
        }
        c.guest_too_many =
            c.guest_usernum == 0 || self.stats.user_online_at_least(c.guest_usernum, max_guest);

        FreeIdCheck {
            is_free: true,
            allowed: !c.guest_too_many,
        }
    }
}

fn load(path: &Path, max_lines: usize) -> Option<Arc<str>> {
    screen::load_text_screen(path, max_lines).map(Arc::from)
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Ban list backed by a sorted table of IPv4 addresses.
pub struct SortedBanList {
    addrs: Vec<u32>,
}

impl SortedBanList {
    pub fn new(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut addrs: Vec<u32> = addrs.into_iter().map(u32::from).collect();
        addrs.sort_unstable();
        addrs.dedup();
        Self { addrs }
    }

    /// One dotted-quad per line; anything unparsable is skipped.
    pub fn load(path: &Path) -> Self {
        let text = std::fs::read_to_string(path).unwrap_or_default();
        Self::new(text.lines().filter_map(|l| l.trim().parse().ok()))
    }
}

impl BanSource for SortedBanList {
    fn is_banned(&self, ip: Ipv4Addr) -> bool {
        self.addrs.binary_search(&u32::from(ip)).is_ok()
    }
}

/// Stand-in stats for deployments without shared-memory observables.
#[derive(Debug, Default)]
pub struct StaticStats;

impl SystemStats for StaticStats {
    fn cpu_load(&self) -> f64 {
        0.0
    }

    fn active_users(&self) -> usize {
        0
    }

    fn search_user(&self, _userid: &str) -> Option<u32> {
        Some(1)
    }

    fn user_online_at_least(&self, _usernum: u32, _count: usize) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeStats {
        cpu: RwLock<f64>,
        active: AtomicUsize,
        guests_online: AtomicUsize,
        table_lookups: AtomicUsize,
        overload_notes: AtomicUsize,
    }

    impl SystemStats for FakeStats {
        fn cpu_load(&self) -> f64 {
            *self.cpu.read()
        }

        fn active_users(&self) -> usize {
            self.active.load(Ordering::Relaxed)
        }

        fn note_user_overload(&self) {
            self.overload_notes.fetch_add(1, Ordering::Relaxed);
        }

        fn search_user(&self, _userid: &str) -> Option<u32> {
            Some(42)
        }

        fn user_online_at_least(&self, usernum: u32, count: usize) -> bool {
            assert_eq!(usernum, 42);
            self.table_lookups.fetch_add(1, Ordering::Relaxed);
            self.guests_online.load(Ordering::Relaxed) >= count
        }
    }

    fn settings_in(dir: &Path) -> Settings {
        Settings {
            home: dir.to_path_buf(),
            regular_check_interval: Duration::ZERO,
            max_guest: Some(2),
            ..Settings::default()
        }
    }

    fn admission(settings: Settings, stats: Arc<FakeStats>) -> Admission {
        Admission::new(Arc::new(settings), stats, Arc::new(SortedBanList::new([])))
    }

    #[test]
    fn welcome_gate_without_any_state() {
        let dir = tempfile::tempdir().unwrap();
        let adm = admission(settings_in(dir.path()), Arc::new(FakeStats::default()));
        adm.reload();
        assert!(matches!(adm.gate(Ipv4Addr::new(10, 0, 0, 1)), Gate::Welcome(None)));
    }

    #[test]
    fn cpu_and_user_overload() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(FakeStats::default());
        let mut s = settings_in(dir.path());
        s.max_active = 10;
        let adm = admission(s, stats.clone());

        *stats.cpu.write() = 99.0;
        adm.reload();
        assert!(matches!(
            adm.gate(Ipv4Addr::LOCALHOST),
            Gate::Overload(OverloadKind::Cpu)
        ));

        *stats.cpu.write() = 0.0;
        stats.active.store(10, Ordering::Relaxed);
        adm.reload();
        assert!(matches!(
            adm.gate(Ipv4Addr::LOCALHOST),
            Gate::Overload(OverloadKind::Users)
        ));
        assert_eq!(stats.overload_notes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ban_file_and_ban_list() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();

        let stats = Arc::new(FakeStats::default());
        let adm = Admission::new(
            Arc::new(settings.clone()),
            stats,
            Arc::new(SortedBanList::new([Ipv4Addr::new(192, 0, 2, 7)])),
        );
        adm.reload();

        // listed peer is rejected even without a site-wide ban
        assert!(matches!(adm.gate(Ipv4Addr::new(192, 0, 2, 7)), Gate::Banned(_)));
        assert!(matches!(adm.gate(Ipv4Addr::new(192, 0, 2, 8)), Gate::Welcome(_)));

        // a ban screen on disk turns everyone away
        std::fs::write(settings.ban_file(), "closed for maintenance\n").unwrap();
        adm.reload();
        match adm.gate(Ipv4Addr::new(192, 0, 2, 8)) {
            Gate::Banned(Some(scr)) => assert_eq!(&*scr, "closed for maintenance\r\n"),
            other => panic!("expected ban, got {}", gate_name(&other)),
        }
    }

    fn gate_name(g: &Gate) -> &'static str {
        match g {
            Gate::Banned(_) => "banned",
            Gate::Overload(_) => "overload",
            Gate::Welcome(_) => "welcome",
        }
    }

    #[test]
    fn guest_quota_caches_the_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(FakeStats::default());
        let mut s = settings_in(dir.path());
        s.regular_check_interval = Duration::from_secs(3600);
        let adm = admission(s, stats.clone());
        adm.reload();

        stats.guests_online.store(2, Ordering::Relaxed);
        let v = adm.check_free_userid("guest");
        assert!(v.is_free && !v.allowed);
        assert_eq!(stats.table_lookups.load(Ordering::Relaxed), 1);

        // cached rejection: the live-user table is not consulted again
        let v = adm.check_free_userid("GUEST");
        assert!(v.is_free && !v.allowed);
        assert_eq!(stats.table_lookups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn guest_flag_clears_on_regular_check() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(FakeStats::default());
        let adm = admission(settings_in(dir.path()), stats.clone());
        adm.reload();

        stats.guests_online.store(2, Ordering::Relaxed);
        assert!(!adm.check_free_userid("guest").allowed);

        stats.guests_online.store(0, Ordering::Relaxed);
        adm.reload(); // zero interval: the check runs and clears the flag
        let v = adm.check_free_userid("guest");
        assert!(v.is_free && v.allowed);
    }

    #[test]
    fn regnew_is_always_admitted_and_plain_ids_are_not_free() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(FakeStats::default());
        let adm = admission(settings_in(dir.path()), stats.clone());
        stats.guests_online.store(99, Ordering::Relaxed);

        let v = adm.check_free_userid("new");
        assert!(v.is_free && v.allowed);
        let v = adm.check_free_userid("alice");
        assert!(!v.is_free);
    }

    #[test]
    fn quota_checks_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(FakeStats::default());
        let mut s = settings_in(dir.path());
        s.dont_check_free_userid = true;
        let adm = admission(s, stats.clone());

        stats.guests_online.store(99, Ordering::Relaxed);
        let v = adm.check_free_userid("guest");
        assert!(v.is_free && v.allowed);
        assert_eq!(stats.table_lookups.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn banners_load_once_and_reload_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(settings.welcome_file(), "hello\n").unwrap();

        let mut quiet = settings.clone();
        quiet.regular_check_interval = Duration::from_secs(3600);
        let adm = admission(quiet, Arc::new(FakeStats::default()));
        adm.reload();
        assert!(matches!(adm.gate(Ipv4Addr::LOCALHOST), Gate::Welcome(Some(_))));

        // no interval elapsed, no pending flag: the file is not re-read
        std::fs::remove_file(settings.welcome_file()).unwrap();
        adm.reload();
        assert!(matches!(adm.gate(Ipv4Addr::LOCALHOST), Gate::Welcome(Some(_))));

        // an explicit request reloads from disk
        adm.request_reload();
        adm.reload();
        assert!(matches!(adm.gate(Ipv4Addr::LOCALHOST), Gate::Welcome(None)));
    }

    #[test]
    fn welcome_mtime_change_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(settings.welcome_file(), "v1\n").unwrap();

        let adm = admission(settings.clone(), Arc::new(FakeStats::default()));
        adm.reload();
        match adm.gate(Ipv4Addr::LOCALHOST) {
            Gate::Welcome(Some(scr)) => assert_eq!(&*scr, "v1\r\n"),
            _ => panic!("expected welcome"),
        }

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(settings.welcome_file(), "v2\n").unwrap();
        adm.reload(); // zero interval: mtime noticed, screens reloaded
        match adm.gate(Ipv4Addr::LOCALHOST) {
            Gate::Welcome(Some(scr)) => assert_eq!(&*scr, "v2\r\n"),
            _ => panic!("expected welcome"),
        }
    }

    #[test]
    fn sorted_ban_list_lookup() {
        let list = SortedBanList::new([
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(172, 16, 0, 1),
        ]);
        assert!(list.is_banned(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(list.is_banned(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!list.is_banned(Ipv4Addr::new(10, 0, 0, 3)));
    }
}
