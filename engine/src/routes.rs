//! Static route table.
//!
//! A route is only reachable from the modes in `allowed_modes` and only
//! renders in the modes in `renders_in`. The panic route is the single
//! exception: `ESCALATE_CRISIS` reaches it from anywhere.

use haven_types::{Mode, RouteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePermission {
    pub id: &'static str,
    /// Modes a request for this route may come from.
    pub allowed_modes: &'static [Mode],
    /// Modes the route may be displayed in once the transition lands.
    pub renders_in: &'static [Mode],
    /// Whether back navigation may leave this route.
    pub allow_back: bool,
    pub requires_confirmation: bool,
}

impl RoutePermission {
    #[must_use]
    pub fn allows_from(&self, mode: Mode) -> bool {
        self.allowed_modes.contains(&mode)
    }

    #[must_use]
    pub fn renders(&self, mode: Mode) -> bool {
        self.renders_in.contains(&mode)
    }
}

pub const WELCOME: &str = "welcome";
pub const PANIC: &str = "panic";

const CONTAINMENT: &[Mode] = &[Mode::CrisisDetected, Mode::NightWatch, Mode::Locked];

const STANDARD_ROUTES: &[RoutePermission] = &[
    RoutePermission {
        id: WELCOME,
        allowed_modes: &[Mode::Idle],
        renders_in: &[Mode::Idle],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "home",
        allowed_modes: &[Mode::Idle, Mode::Normal, Mode::StandDown],
        renders_in: &[Mode::Normal],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "resources",
        allowed_modes: &[Mode::Normal, Mode::Recovery, Mode::StandDown],
        renders_in: &[Mode::Normal, Mode::Recovery, Mode::StandDown],
        allow_back: true,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "settings",
        allowed_modes: &[Mode::Idle, Mode::Normal],
        renders_in: &[Mode::Idle, Mode::Normal],
        allow_back: true,
        requires_confirmation: false,
    },
    RoutePermission {
        id: PANIC,
        allowed_modes: &[Mode::CrisisDetected],
        renders_in: &[Mode::CrisisDetected],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "crisis",
        allowed_modes: &[Mode::CrisisDetected],
        renders_in: &[Mode::CrisisDetected],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "grounding",
        allowed_modes: &[
            Mode::CrisisDetected,
            Mode::NightWatch,
            Mode::Locked,
            Mode::Recovery,
        ],
        renders_in: &[
            Mode::CrisisDetected,
            Mode::NightWatch,
            Mode::Locked,
            Mode::Recovery,
        ],
        allow_back: true,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "lockdown",
        allowed_modes: &[Mode::CrisisDetected, Mode::NightWatch, Mode::Locked],
        renders_in: &[Mode::Locked],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "night_watch",
        allowed_modes: CONTAINMENT,
        renders_in: &[Mode::NightWatch],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "recovery",
        allowed_modes: &[Mode::NightWatch, Mode::Recovery],
        renders_in: &[Mode::Recovery],
        allow_back: false,
        requires_confirmation: false,
    },
    RoutePermission {
        id: "stand_down",
        allowed_modes: &[Mode::Recovery],
        renders_in: &[Mode::StandDown],
        allow_back: false,
        requires_confirmation: true,
    },
];

#[derive(Debug, Clone, Copy)]
pub struct RouteTable {
    routes: &'static [RoutePermission],
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl RouteTable {
    /// The routes Haven ships with.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            routes: STANDARD_ROUTES,
        }
    }

    #[must_use]
    pub const fn new(routes: &'static [RoutePermission]) -> Self {
        Self { routes }
    }

    #[must_use]
    pub fn lookup(&self, id: &RouteId) -> Option<&'static RoutePermission> {
        self.routes.iter().find(|route| route.id == id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static RoutePermission> {
        self.routes.iter()
    }

    /// Route the IDLE state starts on.
    #[must_use]
    pub fn initial_route() -> RouteId {
        RouteId::from(WELCOME)
    }

    #[must_use]
    pub fn is_panic(route: &RoutePermission) -> bool {
        route.id == PANIC
    }
}
