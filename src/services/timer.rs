use crate::error::{AppError, AppResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 定时器任务：每次触发产生一个新的future，串行执行
pub type TimerTask = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug)]
struct TimerState {
    running: bool,
    /// 恢复时要求立即触发一次
    fire_now: bool,
}

/// 可控周期定时器
///
/// 每次触发在专属任务里把task执行完毕后才调度下一次，不会重叠。
/// 暂停/恢复是同步的状态翻转，绝不等待调度循环，避免与把动作回投
/// 给调用方的task形成互等；重复暂停或重复恢复返回错误，由调用方
/// 决定是否记录。取消令牌关闭后，调度循环在一个间隔内退出，并保证
/// 不再触发task。
pub struct Timer {
    name: String,
    state: Arc<Mutex<TimerState>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl Timer {
    /// 启动一个定时器
    ///
    /// `running` 决定初始状态；`run_immediately` 仅在初始运行时生效，
    /// 表示启动后立即触发一次。
    pub fn start(
        name: impl Into<String>,
        pause: Duration,
        cancel: CancellationToken,
        running: bool,
        run_immediately: bool,
        task: TimerTask,
    ) -> Self {
        let name = name.into();
        let state = Arc::new(Mutex::new(TimerState {
            running,
            fire_now: running && run_immediately,
        }));
        let notify = Arc::new(Notify::new());

        tokio::spawn(run_loop(
            name.clone(),
            pause,
            cancel.clone(),
            state.clone(),
            notify.clone(),
            task,
        ));

        Self {
            name,
            state,
            notify,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 暂停调度；已在暂停状态时返回错误
    pub fn pause(&self) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            warn!("定时器 {} 重复暂停", self.name);
            return Err(AppError::timer(format!(
                "定时器 {} 已处于暂停状态",
                self.name
            )));
        }
        state.running = false;
        state.fire_now = false;
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// 恢复调度；已在运行状态时返回错误
    ///
    /// `run_immediately` 为true时恢复后立即触发一次。
    pub fn resume(&self, run_immediately: bool) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            warn!("定时器 {} 重复恢复", self.name);
            return Err(AppError::timer(format!(
                "定时器 {} 已处于运行状态",
                self.name
            )));
        }
        state.running = true;
        state.fire_now = run_immediately;
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// 停止定时器，可重复调用
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    name: String,
    pause: Duration,
    cancel: CancellationToken,
    state: Arc<Mutex<TimerState>>,
    notify: Arc<Notify>,
    task: TimerTask,
) {
    debug!("定时器 {} 启动, 间隔 {:?}", name, pause);
    loop {
        let (running, fire_now) = {
            let mut guard = state.lock().unwrap();
            let snapshot = (guard.running, guard.fire_now);
            guard.fire_now = false;
            snapshot
        };

        if running && fire_now {
            task().await;
            continue;
        }

        if running {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(pause) => {
                    // 睡眠期间可能被暂停，触发前再确认一次
                    if state.lock().unwrap().running {
                        task().await;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notify.notified() => {}
            }
        }
    }
    debug!("定时器 {} 退出", name);
}
