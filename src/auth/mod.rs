//! Authentication: detection, login/registration execution, create forms.

pub mod create_page;
pub mod detector;
pub mod login;

pub use create_page::{CreateOutcome, CreatePageHandler};
pub use detector::{
    detect, determine_auth_strategy, AuthDecision, AuthDetection, AuthStrategy, LoginForm,
    RegistrationForm,
};
pub use login::LoginFlow;
