//! Assembles stage sequences for every list and detail view.
//!
//! [`ListPipeline`] covers the paginated feeds (videos, tweets, comments)
//! and always emits stages in the same order: text search, owner/parent
//! filters, visibility, sort, joins and derived fields, projection. The free
//! functions below build the fixed-shape views (video detail, subscriber
//! lists, playlists, liked videos, watch history).

use std::str::FromStr;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::stage::{Expr, Pipeline, Projection, SortDirection, SortSpec, Stage};
use crate::store::Collection;

/// Entity kinds that have a paginated feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Video,
    Tweet,
    Comment,
}

impl EntityKind {
    pub fn collection(self) -> Collection {
        match self {
            EntityKind::Video => Collection::Videos,
            EntityKind::Tweet => Collection::Tweets,
            EntityKind::Comment => Collection::Comments,
        }
    }

    /// Field of a like record that points at this kind.
    fn like_field(self) -> &'static str {
        match self {
            EntityKind::Video => "video",
            EntityKind::Tweet => "tweet",
            EntityKind::Comment => "comment",
        }
    }

    fn owner_field(self) -> &'static str {
        match self {
            EntityKind::Video | EntityKind::Tweet => "ownerDetails",
            EntityKind::Comment => "owner",
        }
    }

    fn public_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Video => &[
                "title",
                "description",
                "videoFile.url",
                "thumbnail.url",
                "duration",
                "views",
                "createdAt",
                "ownerDetails",
                "likesCount",
                "isLiked",
            ],
            EntityKind::Tweet => &["content", "createdAt", "ownerDetails", "likesCount", "isLiked"],
            EntityKind::Comment => &["content", "createdAt", "owner", "likesCount", "isLiked"],
        }
    }
}

/// Sortable fields. Each kind accepts a subset; anything else is rejected
/// instead of reaching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Views,
    Duration,
    Title,
}

impl SortField {
    pub fn field_name(self) -> &'static str {
        match self {
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
            SortField::Views => "views",
            SortField::Duration => "duration",
            SortField::Title => "title",
        }
    }

    pub fn allowed_for(self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Video => true,
            EntityKind::Tweet | EntityKind::Comment => {
                matches!(self, SortField::CreatedAt | SortField::UpdatedAt)
            }
        }
    }

    pub fn parse_for(kind: EntityKind, raw: &str) -> CoreResult<Self> {
        let field: SortField = raw.parse()?;
        if !field.allowed_for(kind) {
            return Err(CoreError::invalid(format!(
                "cannot sort {} by `{}`",
                kind.collection().table(),
                raw.trim()
            )));
        }
        Ok(field)
    }
}

impl FromStr for SortField {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "createdAt" => Ok(SortField::CreatedAt),
            "updatedAt" => Ok(SortField::UpdatedAt),
            "views" => Ok(SortField::Views),
            "duration" => Ok(SortField::Duration),
            "title" => Ok(SortField::Title),
            other => Err(CoreError::invalid(format!("unknown sort key `{other}`"))),
        }
    }
}

/// Request shape of a paginated feed.
#[derive(Debug, Clone)]
pub struct ListPipeline {
    kind: EntityKind,
    query: Option<String>,
    owner: Option<Uuid>,
    video: Option<Uuid>,
    published_only: bool,
    sort_key: Option<String>,
    sort_direction: Option<String>,
    viewer: Option<Uuid>,
}

impl ListPipeline {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            query: None,
            owner: None,
            video: None,
            published_only: kind == EntityKind::Video,
            sort_key: None,
            sort_direction: None,
            viewer: None,
        }
    }

    /// Blank queries are ignored.
    pub fn search(mut self, query: Option<&str>) -> Self {
        self.query = query
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .map(str::to_owned);
        self
    }

    pub fn owner(mut self, owner: Option<Uuid>) -> Self {
        self.owner = owner;
        self
    }

    /// Restricts a comment feed to one video.
    pub fn on_video(mut self, video: Uuid) -> Self {
        self.video = Some(video);
        self
    }

    pub fn published_only(mut self, published_only: bool) -> Self {
        self.published_only = published_only;
        self
    }

    pub fn sort(mut self, key: Option<&str>, direction: Option<&str>) -> Self {
        self.sort_key = key.map(str::to_owned).filter(|key| !key.trim().is_empty());
        self.sort_direction = direction
            .map(str::to_owned)
            .filter(|direction| !direction.trim().is_empty());
        self
    }

    pub fn viewer(mut self, viewer: Option<Uuid>) -> Self {
        self.viewer = viewer;
        self
    }

    pub fn build(self) -> CoreResult<Pipeline> {
        let sort = self.resolve_sort()?;
        let collection = self.kind.collection();
        let mut stages = Vec::new();

        if let Some(query) = self.query {
            stages.push(Stage::Search {
                fields: collection
                    .search_fields()
                    .iter()
                    .map(|field| (*field).to_owned())
                    .collect(),
                query,
            });
        }
        if let Some(owner) = self.owner {
            stages.push(Stage::match_eq("owner", owner.to_string()));
        }
        if let Some(video) = self.video {
            stages.push(Stage::match_eq("video", video.to_string()));
        }
        if self.published_only && self.kind == EntityKind::Video {
            stages.push(Stage::match_eq("isPublished", true));
        }
        stages.push(Stage::Sort(vec![sort]));

        let owner_field = self.kind.owner_field();
        stages.push(owner_summary_lookup(owner_field));
        stages.push(Stage::unwind(owner_field));
        stages.extend(like_stages(self.kind, self.viewer));
        stages.push(Stage::project(self.kind.public_fields()));

        Ok(Pipeline::new(collection, stages))
    }

    /// `createdAt` descending unless both key and direction are given. An
    /// unknown key is rejected even when no direction accompanies it.
    fn resolve_sort(&self) -> CoreResult<SortSpec> {
        let key = self
            .sort_key
            .as_deref()
            .map(|key| SortField::parse_for(self.kind, key))
            .transpose()?;
        match (key, self.sort_direction.as_deref()) {
            (Some(field), Some(direction)) => Ok(SortSpec {
                field: field.field_name().to_owned(),
                direction: SortDirection::parse(direction),
            }),
            _ => Ok(SortSpec {
                field: SortField::CreatedAt.field_name().to_owned(),
                direction: SortDirection::Desc,
            }),
        }
    }
}

fn viewer_value(viewer: Option<Uuid>) -> Option<Value> {
    viewer.map(|viewer| Value::String(viewer.to_string()))
}

/// `{_id, username, avatar: {url}}` of the record's owner under `as_field`.
fn owner_summary_lookup(as_field: &str) -> Stage {
    Stage::lookup(
        Collection::Users,
        "owner",
        "_id",
        as_field,
        vec![Stage::project(&["username", "avatar.url"])],
    )
}

fn like_stages(kind: EntityKind, viewer: Option<Uuid>) -> Vec<Stage> {
    vec![
        Stage::lookup(
            Collection::Likes,
            "_id",
            kind.like_field(),
            "likes",
            vec![Projection::fields(&["likedBy"]).without_id().into()],
        ),
        Stage::add_fields(vec![
            ("likesCount", Expr::Size("likes".into())),
            (
                "isLiked",
                Expr::Contains {
                    array: "likes.likedBy".into(),
                    value: viewer_value(viewer),
                },
            ),
        ]),
    ]
}

/// Single video with its owner channel (subscriber count, whether the viewer
/// subscribes) and like totals. Visibility is not filtered here.
pub fn video_detail(video: Uuid, viewer: Option<Uuid>) -> Pipeline {
    let mut stages = vec![Stage::match_eq("_id", video.to_string())];
    stages.extend(like_stages(EntityKind::Video, viewer));
    stages.push(Stage::lookup(
        Collection::Users,
        "owner",
        "_id",
        "owner",
        vec![
            Stage::lookup(
                Collection::Subscriptions,
                "_id",
                "channel",
                "subscribers",
                Vec::new(),
            ),
            Stage::add_fields(vec![
                ("subscriberCount", Expr::Size("subscribers".into())),
                (
                    "isSubscribed",
                    Expr::Contains {
                        array: "subscribers.subscriber".into(),
                        value: viewer_value(viewer),
                    },
                ),
            ]),
            Stage::project(&["username", "avatar.url", "subscriberCount", "isSubscribed"]),
        ],
    ));
    stages.push(Stage::add_fields(vec![("owner", Expr::First("owner".into()))]));
    stages.push(Stage::project(&[
        "videoFile.url",
        "thumbnail.url",
        "title",
        "description",
        "views",
        "createdAt",
        "duration",
        "owner",
        "likesCount",
        "isLiked",
    ]));
    Pipeline::new(Collection::Videos, stages)
}

/// Subscribers of `channel`, each with its own subscriber count and whether
/// `channel` subscribes back. The inner join runs inside the user join.
pub fn channel_subscribers(channel: Uuid) -> Pipeline {
    let stages = vec![
        Stage::match_eq("channel", channel.to_string()),
        Stage::lookup(
            Collection::Users,
            "subscriber",
            "_id",
            "subscriber",
            vec![
                Stage::lookup(
                    Collection::Subscriptions,
                    "_id",
                    "channel",
                    "subscribedToSubscriber",
                    Vec::new(),
                ),
                Stage::add_fields(vec![
                    ("subscriberCount", Expr::Size("subscribedToSubscriber".into())),
                    (
                        "isSubscribedBack",
                        Expr::Contains {
                            array: "subscribedToSubscriber.subscriber".into(),
                            value: Some(Value::String(channel.to_string())),
                        },
                    ),
                ]),
            ],
        ),
        Stage::unwind("subscriber"),
        Stage::sort("createdAt", SortDirection::Desc),
        Projection::fields(&[
            "subscriber._id",
            "subscriber.username",
            "subscriber.fullName",
            "subscriber.avatar.url",
            "subscriber.subscriberCount",
            "subscriber.isSubscribedBack",
        ])
        .without_id()
        .into(),
    ];
    Pipeline::new(Collection::Subscriptions, stages)
}

/// Channels `subscriber` follows, each with its latest published video.
pub fn subscribed_channels(subscriber: Uuid) -> Pipeline {
    let stages = vec![
        Stage::match_eq("subscriber", subscriber.to_string()),
        Stage::lookup(
            Collection::Users,
            "channel",
            "_id",
            "subscribedChannel",
            vec![
                Stage::lookup(
                    Collection::Videos,
                    "_id",
                    "owner",
                    "videos",
                    vec![
                        Stage::match_eq("isPublished", true),
                        Stage::sort("createdAt", SortDirection::Desc),
                        Stage::Limit(1),
                    ],
                ),
                Stage::add_fields(vec![("latestVideo", Expr::First("videos".into()))]),
            ],
        ),
        Stage::unwind("subscribedChannel"),
        Projection::fields(&[
            "subscribedChannel._id",
            "subscribedChannel.username",
            "subscribedChannel.fullName",
            "subscribedChannel.avatar.url",
            "subscribedChannel.latestVideo._id",
            "subscribedChannel.latestVideo.title",
            "subscribedChannel.latestVideo.description",
            "subscribedChannel.latestVideo.videoFile.url",
            "subscribedChannel.latestVideo.thumbnail.url",
            "subscribedChannel.latestVideo.duration",
            "subscribedChannel.latestVideo.views",
            "subscribedChannel.latestVideo.createdAt",
        ])
        .without_id()
        .into(),
    ];
    Pipeline::new(Collection::Subscriptions, stages)
}

/// Published videos liked by `viewer`, most recent like first.
pub fn liked_videos(viewer: Uuid) -> Pipeline {
    let stages = vec![
        Stage::match_eq("likedBy", viewer.to_string()),
        Stage::match_exists("video"),
        Stage::lookup(
            Collection::Videos,
            "video",
            "_id",
            "likedVideo",
            vec![
                Stage::match_eq("isPublished", true),
                owner_summary_lookup("ownerDetails"),
                Stage::unwind("ownerDetails"),
            ],
        ),
        Stage::unwind("likedVideo"),
        Stage::sort("createdAt", SortDirection::Desc),
        Projection::fields(&[
            "likedVideo._id",
            "likedVideo.title",
            "likedVideo.description",
            "likedVideo.videoFile.url",
            "likedVideo.thumbnail.url",
            "likedVideo.duration",
            "likedVideo.views",
            "likedVideo.createdAt",
            "likedVideo.ownerDetails",
        ])
        .without_id()
        .into(),
    ];
    Pipeline::new(Collection::Likes, stages)
}

fn playlist_totals() -> Stage {
    Stage::add_fields(vec![
        ("totalVideos", Expr::Size("videos".into())),
        ("totalViews", Expr::Sum("videos.views".into())),
    ])
}

/// One playlist with owner summary, totals and its published videos.
pub fn playlist_detail(playlist: Uuid) -> Pipeline {
    let stages = vec![
        Stage::match_eq("_id", playlist.to_string()),
        Stage::lookup(
            Collection::Videos,
            "videos",
            "_id",
            "videos",
            vec![Stage::match_eq("isPublished", true)],
        ),
        playlist_totals(),
        Stage::lookup(
            Collection::Users,
            "owner",
            "_id",
            "owner",
            vec![Stage::project(&["username", "fullName", "avatar.url"])],
        ),
        Stage::add_fields(vec![("owner", Expr::First("owner".into()))]),
        Stage::project(&[
            "name",
            "description",
            "createdAt",
            "updatedAt",
            "totalVideos",
            "totalViews",
            "owner",
            "videos._id",
            "videos.title",
            "videos.description",
            "videos.videoFile.url",
            "videos.thumbnail.url",
            "videos.duration",
            "videos.views",
            "videos.createdAt",
        ]),
    ];
    Pipeline::new(Collection::Playlists, stages)
}

/// Playlists owned by `owner`, most recently updated first. Totals count
/// published videos only.
pub fn user_playlists(owner: Uuid) -> Pipeline {
    let stages = vec![
        Stage::match_eq("owner", owner.to_string()),
        Stage::lookup(
            Collection::Videos,
            "videos",
            "_id",
            "videos",
            vec![Stage::match_eq("isPublished", true)],
        ),
        playlist_totals(),
        Stage::sort("updatedAt", SortDirection::Desc),
        Stage::project(&["name", "description", "totalVideos", "totalViews", "updatedAt"]),
    ];
    Pipeline::new(Collection::Playlists, stages)
}

/// The user's watch history joined with each video's owner summary.
pub fn watch_history(user: Uuid) -> Pipeline {
    let stages = vec![
        Stage::match_eq("_id", user.to_string()),
        Stage::lookup(
            Collection::Videos,
            "watchHistory",
            "_id",
            "watchHistory",
            vec![
                owner_summary_lookup("ownerDetails"),
                Stage::unwind("ownerDetails"),
                Stage::project(&[
                    "title",
                    "description",
                    "videoFile.url",
                    "thumbnail.url",
                    "duration",
                    "views",
                    "createdAt",
                    "ownerDetails",
                ]),
            ],
        ),
        Projection::fields(&["watchHistory"]).without_id().into(),
    ];
    Pipeline::new(Collection::Users, stages)
}
