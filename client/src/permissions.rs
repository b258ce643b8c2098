use bitflags::bitflags;

bitflags! {
    /// What a user may do with live attendance sessions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionPermissions: u32 {
        const VIEW_SESSIONS     = 1 << 0;
        const MARK_ATTENDANCE   = 1 << 1;
        const MANAGE_SESSIONS   = 1 << 2;
        const VIEW_STATS        = 1 << 3;
    }
}

/// Default permissions for staff who only observe.
pub const DEFAULT_STAFF: SessionPermissions =
    SessionPermissions::VIEW_SESSIONS.union(SessionPermissions::VIEW_STATS);

/// Default permissions for a class teacher.
pub const DEFAULT_TEACHER: SessionPermissions = DEFAULT_STAFF
    .union(SessionPermissions::MARK_ATTENDANCE)
    .union(SessionPermissions::MANAGE_SESSIONS);

/// A gated command of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Create,
    Join,
    Mark,
    Close,
    Refresh,
    Stats,
}

impl SessionAction {
    pub fn required(&self) -> SessionPermissions {
        match self {
            Self::Create | Self::Close => SessionPermissions::MANAGE_SESSIONS,
            Self::Join | Self::Refresh => SessionPermissions::VIEW_SESSIONS,
            Self::Mark => SessionPermissions::MARK_ATTENDANCE,
            Self::Stats => SessionPermissions::VIEW_STATS,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Create => "create attendance sessions",
            Self::Join => "join attendance sessions",
            Self::Mark => "mark attendance",
            Self::Close => "close attendance sessions",
            Self::Refresh => "view attendance sessions",
            Self::Stats => "view attendance statistics",
        }
    }
}

/// Decides whether the local user may issue a command.
pub trait PermissionEvaluator: Send + Sync {
    fn allows(&self, action: SessionAction) -> bool;
}

impl PermissionEvaluator for SessionPermissions {
    fn allows(&self, action: SessionAction) -> bool {
        self.contains(action.required())
    }
}

/// Dashboard roles ordered by privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StaffRole {
    Student,
    Staff,
    Teacher,
    Admin,
    SuperAdmin,
}

impl StaffRole {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "superadmin" | "super_admin" | "super-admin" => Self::SuperAdmin,
            "admin" => Self::Admin,
            "teacher" => Self::Teacher,
            "staff" => Self::Staff,
            _ => Self::Student,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "superadmin",
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Staff => "staff",
            Self::Student => "student",
        }
    }

    pub fn to_default_permissions(&self) -> SessionPermissions {
        match self {
            Self::Student => SessionPermissions::empty(),
            Self::Staff => DEFAULT_STAFF,
            Self::Teacher => DEFAULT_TEACHER,
            Self::Admin | Self::SuperAdmin => SessionPermissions::all(),
        }
    }
}

impl PermissionEvaluator for StaffRole {
    fn allows(&self, action: SessionAction) -> bool {
        self.to_default_permissions().allows(action)
    }
}
