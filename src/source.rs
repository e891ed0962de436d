//! Where course lists and sign records come from.
//!
//! [`RollCallClient`] talks to the campus roll-call backend; [`FixtureSource`]
//! replays saved responses from disk. Only the client can submit sign-ins and
//! sign-outs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::{AttendanceStatus, ClassAttendanceEntry};
use crate::upstream::{
    CourseListResponse, RawCourse, RawSignRecord, SignListResponse, SubmitResponse,
};

pub const DEFAULT_BASE_URL: &str = "https://rollcall.anlaxy.com.cn/SerApi/v02";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const SOURCE_PLATFORM: u8 = 2;

const COMM_DAY_COURSE_LIST: &str = "RollCall_SourceListDay";
const COMM_DAY_SIGN_LIST: &str = "RollCall_SourceSignList";
const COMM_SIGN_IN: &str = "RollCall_SignInSource";
const COMM_SIGN_OUT: &str = "RollCall_SignOutSource";

// Sign type codes on the wire.
const TYPE_LATE: &str = "1";
const TYPE_NORMAL: &str = "2";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {comm} failed: {source}")]
    Http {
        comm: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{comm} returned HTTP {status}")]
    Status {
        comm: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("{comm} rejected the request (state {state:?}): {info}")]
    Rejected {
        comm: &'static str,
        state: String,
        info: String,
    },
    #[error("could not encode {comm} request: {source}")]
    Encode {
        comm: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not decode {comm} response: {source}")]
    Decode {
        comm: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only access to one day of attendance data.
#[async_trait]
pub trait AttendanceSource: Send + Sync {
    async fn fetch_day_course_list(
        &self,
        date: NaiveDate,
        session_key: &str,
    ) -> Result<Vec<RawCourse>, FetchError>;

    async fn fetch_day_sign_list(
        &self,
        date: NaiveDate,
        session_key: &str,
    ) -> Result<Vec<RawSignRecord>, FetchError>;
}

#[derive(Serialize)]
struct Envelope<'a, P> {
    #[serde(rename = "CommType")]
    comm_type: &'static str,
    #[serde(rename = "Comm")]
    comm: &'a str,
    #[serde(rename = "Param")]
    param: P,
}

#[derive(Serialize)]
struct DayParam<'a> {
    #[serde(rename = "Source_PlatForm")]
    source_platform: u8,
    date: String,
    #[serde(rename = "userKey")]
    user_key: &'a str,
}

#[derive(Serialize)]
struct SignInParam<'a> {
    #[serde(rename = "Source_PlatForm")]
    source_platform: u8,
    #[serde(rename = "userKey")]
    user_key: &'a str,
    pk_anlaxy_syllabus_user: &'a str,
    sign_in_type: &'static str,
    u_begin_time: String,
    late_time_length: &'static str,
    late_num: &'static str,
    ask_leave_num: &'static str,
    in_longitude: &'static str,
    in_latitude: &'static str,
    phone_code: &'a str,
}

#[derive(Serialize)]
struct SignOutParam<'a> {
    #[serde(rename = "Source_PlatForm")]
    source_platform: u8,
    #[serde(rename = "userKey")]
    user_key: &'a str,
    pk_anlaxy_syllabus_user: &'a str,
    phone_code: &'a str,
    sign_out_type: &'static str,
    u_end_time: String,
    lesson_change_list: &'a str,
    lesson_change_type: &'static str,
    ask_leave_num: &'static str,
    out_longitude: &'static str,
    out_latitude: &'static str,
    in_longitude: &'static str,
    in_latitude: &'static str,
    reviewscore: &'static str,
    reviewcontent: &'static str,
    sign_in_type: &'static str,
    u_begin_time: String,
    before_class_over_time: String,
    late_time_length: &'static str,
    late_num: &'static str,
}

/// Why a class cannot be signed in or out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitRefused {
    #[error("class #{0} is marked absent or on leave")]
    Excused(usize),
    #[error("class #{0} is already signed in")]
    AlreadySignedIn(usize),
    #[error("class #{0} is already signed out")]
    AlreadySignedOut(usize),
}

/// A sign-in or sign-out for one reconciled class.
///
/// The sign type follows the entry's derived status: a `Late` class is
/// submitted as late, anything else as normal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub order_index: usize,
    pub lesson_key: String,
    pub session_user_key: String,
    pub late: bool,
    pub at: NaiveDateTime,
    pub signed_in_at: Option<NaiveDateTime>,
    pub sign_out_opens_at: NaiveDateTime,
}

impl Submission {
    fn from_entry(entry: &ClassAttendanceEntry, at: NaiveDateTime) -> Result<Self, SubmitRefused> {
        let Some(status) = entry.status else {
            return Err(SubmitRefused::Excused(entry.order_index));
        };
        Ok(Self {
            order_index: entry.order_index,
            lesson_key: entry.lesson_key.clone(),
            session_user_key: entry.session_user_key.clone(),
            late: status == AttendanceStatus::Late,
            at,
            signed_in_at: entry.sign_in,
            sign_out_opens_at: entry.sign_out_opens_at,
        })
    }

    pub fn sign_in(entry: &ClassAttendanceEntry, at: NaiveDateTime) -> Result<Self, SubmitRefused> {
        let submission = Self::from_entry(entry, at)?;
        if entry.sign_in.is_some() {
            return Err(SubmitRefused::AlreadySignedIn(entry.order_index));
        }
        Ok(submission)
    }

    pub fn sign_out(entry: &ClassAttendanceEntry, at: NaiveDateTime) -> Result<Self, SubmitRefused> {
        let submission = Self::from_entry(entry, at)?;
        if entry.sign_out.is_some() {
            return Err(SubmitRefused::AlreadySignedOut(entry.order_index));
        }
        Ok(submission)
    }

    fn sign_type(&self) -> &'static str {
        if self.late {
            TYPE_LATE
        } else {
            TYPE_NORMAL
        }
    }
}

/// Builds the `interface=` form body the backend expects: the JSON envelope,
/// Base64-encoded twice.
pub fn encode_interface<P: Serialize>(comm: &str, param: P) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(&Envelope {
        comm_type: "utils",
        comm,
        param,
    })?;
    let once = STANDARD.encode(json);
    Ok(format!("interface={}", STANDARD.encode(once)))
}

/// Checks a response `state`; `"1"` means success.
fn ensure_accepted(comm: &'static str, state: &str, info: Option<String>) -> Result<(), FetchError> {
    if state == "1" {
        return Ok(());
    }
    Err(FetchError::Rejected {
        comm,
        state: state.to_string(),
        info: info.unwrap_or_default(),
    })
}

/// HTTP client for the roll-call backend.
#[derive(Debug, Clone)]
pub struct RollCallClient {
    client: reqwest::Client,
    base_url: String,
}

impl RollCallClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        comm: &'static str,
        date: NaiveDate,
        session_key: &str,
    ) -> Result<T, FetchError> {
        let param = DayParam {
            source_platform: SOURCE_PLATFORM,
            date: date.format("%Y-%m-%d").to_string(),
            user_key: session_key,
        };
        debug!(comm, %date, "calling roll-call backend");
        self.post(comm, param).await
    }

    async fn post<T: DeserializeOwned, P: Serialize>(
        &self,
        comm: &'static str,
        param: P,
    ) -> Result<T, FetchError> {
        let body = encode_interface(comm, param).map_err(|source| FetchError::Encode { comm, source })?;
        let response = self
            .client
            .post(&self.base_url)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .body(body)
            .send()
            .await
            .map_err(|source| FetchError::Http { comm, source })?;

        let status = response.status();
        if !status.is_success() {
            warn!(comm, status = %status, "roll-call backend returned an error status");
            return Err(FetchError::Status { comm, status });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Http { comm, source })?;
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode { comm, source })
    }

    /// Submits a sign-in at `submission.at`.
    pub async fn sign_in(
        &self,
        session_key: &str,
        submission: &Submission,
        phone_code: &str,
    ) -> Result<(), FetchError> {
        let param = SignInParam {
            source_platform: SOURCE_PLATFORM,
            user_key: session_key,
            pk_anlaxy_syllabus_user: &submission.session_user_key,
            sign_in_type: submission.sign_type(),
            u_begin_time: submission.at.format("%Y-%m-%d %H:%M:%S").to_string(),
            late_time_length: "0",
            late_num: "0",
            ask_leave_num: "0",
            in_longitude: "0",
            in_latitude: "0",
            phone_code,
        };
        let response: SubmitResponse = self.post(COMM_SIGN_IN, param).await?;
        ensure_accepted(COMM_SIGN_IN, &response.state, response.info)?;
        info!(class = submission.order_index, late = submission.late, "signed in");
        Ok(())
    }

    /// Submits a sign-out at `submission.at`.
    pub async fn sign_out(
        &self,
        session_key: &str,
        submission: &Submission,
        phone_code: &str,
    ) -> Result<(), FetchError> {
        let param = SignOutParam {
            source_platform: SOURCE_PLATFORM,
            user_key: session_key,
            pk_anlaxy_syllabus_user: &submission.session_user_key,
            phone_code,
            sign_out_type: submission.sign_type(),
            u_end_time: submission.at.format("%H:%M").to_string(),
            lesson_change_list: &submission.lesson_key,
            lesson_change_type: "0",
            ask_leave_num: "0",
            out_longitude: "0",
            out_latitude: "0",
            in_longitude: "",
            in_latitude: "",
            reviewscore: "10",
            reviewcontent: "",
            sign_in_type: submission.sign_type(),
            u_begin_time: submission
                .signed_in_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            before_class_over_time: submission.sign_out_opens_at.format("%H:%M").to_string(),
            late_time_length: "0",
            late_num: "0",
        };
        let response: SubmitResponse = self.post(COMM_SIGN_OUT, param).await?;
        ensure_accepted(COMM_SIGN_OUT, &response.state, response.info)?;
        info!(class = submission.order_index, late = submission.late, "signed out");
        Ok(())
    }
}

#[async_trait]
impl AttendanceSource for RollCallClient {
    async fn fetch_day_course_list(
        &self,
        date: NaiveDate,
        session_key: &str,
    ) -> Result<Vec<RawCourse>, FetchError> {
        let response: CourseListResponse = self.call(COMM_DAY_COURSE_LIST, date, session_key).await?;
        ensure_accepted(COMM_DAY_COURSE_LIST, &response.state, response.info)?;
        debug!(count = response.sourcelist.len(), "fetched day course list");
        Ok(response.sourcelist)
    }

    async fn fetch_day_sign_list(
        &self,
        date: NaiveDate,
        session_key: &str,
    ) -> Result<Vec<RawSignRecord>, FetchError> {
        let response: SignListResponse = self.call(COMM_DAY_SIGN_LIST, date, session_key).await?;
        ensure_accepted(COMM_DAY_SIGN_LIST, &response.state, response.info)?;
        debug!(count = response.sign_record_list.len(), "fetched day sign list");
        Ok(response.sign_record_list)
    }
}

/// Replays saved backend responses from `courses-<date>.json` and
/// `signs-<date>.json` in a directory. The session key is not checked.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load<T: DeserializeOwned>(
        &self,
        comm: &'static str,
        prefix: &str,
        date: NaiveDate,
    ) -> Result<T, FetchError> {
        let path = self.dir.join(format!("{prefix}-{}.json", date.format("%Y-%m-%d")));
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| FetchError::Io { path: path.clone(), source })?;
        debug!(path = %path.display(), "loaded fixture");
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode { comm, source })
    }
}

#[async_trait]
impl AttendanceSource for FixtureSource {
    async fn fetch_day_course_list(
        &self,
        date: NaiveDate,
        _session_key: &str,
    ) -> Result<Vec<RawCourse>, FetchError> {
        let response: CourseListResponse = self.load(COMM_DAY_COURSE_LIST, "courses", date).await?;
        ensure_accepted(COMM_DAY_COURSE_LIST, &response.state, response.info)?;
        Ok(response.sourcelist)
    }

    async fn fetch_day_sign_list(
        &self,
        date: NaiveDate,
        _session_key: &str,
    ) -> Result<Vec<RawSignRecord>, FetchError> {
        let response: SignListResponse = self.load(COMM_DAY_SIGN_LIST, "signs", date).await?;
        ensure_accepted(COMM_DAY_SIGN_LIST, &response.state, response.info)?;
        Ok(response.sign_record_list)
    }
}
