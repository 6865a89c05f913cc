//! Background workers: meeting sync, reminders, backups and the weekly report.

pub mod backups;
pub mod meeting_sync;
pub mod reminders;
pub mod reports;

pub use backups::{spawn_backup_task, ArtifactStore, BackupError, BackupTask, S3ArtifactStore};
pub use meeting_sync::{MeetingJob, MeetingSync, MeetingSyncEngine};
pub use reminders::{spawn_reminder_task, ReminderTask};
pub use reports::{spawn_weekly_report_task, weekly_report};
