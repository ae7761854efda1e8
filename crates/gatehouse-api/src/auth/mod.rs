//! Token lifecycle and invitation redemption
//!
//! - Token signing and verification (`jwt`)
//! - Revocation ledger keyed by `jti` (`blacklist`)
//! - Issuance, validation, rotation and mass invalidation (`tokens`)
//! - Single-use invitations (`invitation`)
//! - Per-IP attempt counters (`rate_limit`)
//! - Login, registration and logout flows (`service`)
//! - Request authentication middleware (`middleware`)

pub mod blacklist;
pub mod invitation;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod service;
pub mod tokens;

pub use blacklist::Blacklist;
pub use invitation::{CheckOutcome, InvitationService, ProbeResult, Redemption};
pub use jwt::{hash_token, peek_unverified, ExpiryMode, TokenPayload, TokenSigner};
pub use middleware::{auth_middleware, require_admin, AuthenticatedUser};
pub use models::{
    AuthResponse, CreateInvitationRequest, InvalidateRequest, InvalidationResponse,
    InvitationCheckResponse, InvitationResponse, LoginRequest, LogoutRequest, LogoutResponse,
    LogoutScope, MeResponse, ProbeResponse, RedeemRequest, RedeemResponse, RefreshRequest,
    RegisterRequest, UserInfo,
};
pub use rate_limit::RateLimiter;
pub use service::{AuthService, ClientInfo};
pub use tokens::{InvalidationReport, TokenPair, TokenService};
