//! UI 控制器的系统提示词
//!
//! 默认使用内置提示词（带当天日期）；配置了 [app].system_prompt_path 时从文件读取。

use chrono::{Datelike, Local, NaiveDate, Weekday};

use crate::config::AppConfig;

fn weekday_zh(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "星期一",
        Weekday::Tue => "星期二",
        Weekday::Wed => "星期三",
        Weekday::Thu => "星期四",
        Weekday::Fri => "星期五",
        Weekday::Sat => "星期六",
        Weekday::Sun => "星期日",
    }
}

/// 内置提示词：说明动作语法与输出格式
pub fn build_system_prompt(date: NaiveDate) -> String {
    let formatted = format!("{} {}", date.format("%Y年%m月%d日"), weekday_zh(date.weekday()));
    format!(
        r#"今天的日期是：{formatted}

你是一个手机界面操作助手。每一步你会看到当前屏幕截图，请先简要思考，再输出且只输出一个动作。

坐标使用相对坐标：屏幕左上角为 [0,0]，右下角为 [1000,1000]。

可用动作：
- do(action="Launch", app="应用名")            启动应用
- do(action="Tap", element=[x,y])              点击
- do(action="Long Press", element=[x,y])       长按
- do(action="Swipe", start=[x1,y1], end=[x2,y2])  滑动
- do(action="Type", text="文本")               清空当前输入框并输入文本
- do(action="Back")                            返回
- do(action="Home")                            回到桌面
- do(action="Key", code=键码, meta=修饰键)     发送按键
- do(action="Wait", duration="2 seconds")      等待页面加载
- do(action="Switch_surface", session="会话id") 切换到另一个会话的虚拟屏
- do(action="Take_over", message="原因")       需要用户接管（登录、验证码、支付等）
- finish(message="结果说明")                   任务完成

规则：
1. 先思考，再在最后一行给出动作；不要输出多余的动作。
2. 如果没有截图，先启动目标应用。
3. 页面未加载完成时使用 Wait，不要反复点击。
4. 涉及登录、验证码、付款时使用 Take_over。
5. 任务完成后使用 finish，并在 message 中总结结果。"#
    )
}

/// 按配置加载提示词：文件读取失败时退回内置提示词
pub fn load_system_prompt(cfg: &AppConfig) -> String {
    if let Some(path) = &cfg.app.system_prompt_path {
        match std::fs::read_to_string(path) {
            Ok(text) if !text.trim().is_empty() => return text,
            Ok(_) => tracing::warn!("System prompt file {} is empty, using built-in", path.display()),
            Err(e) => tracing::warn!("Failed to read system prompt {}: {}", path.display(), e),
        }
    }
    build_system_prompt(Local::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_has_date_and_grammar() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        let prompt = build_system_prompt(date);
        assert!(prompt.contains("2024年05月20日 星期一"));
        assert!(prompt.contains("do(action=\"Tap\""));
        assert!(prompt.contains("finish(message="));
    }
}
